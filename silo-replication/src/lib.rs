//! Replication framework for silodb.
//!
//! A classic single-decree paxos core (`paxos`) is layered into a replicated
//! log (`log`) that chooses one value per instance and delivers them in
//! order, with a PaxosLease leader lease (`lease`) providing the
//! single-writer fast path. The protocol state machines are synchronous and
//! clock-explicit: they consume messages plus a millisecond timestamp and
//! emit envelopes into an outbox, which makes whole quorums runnable on an
//! in-memory bus in tests. The tokio-backed `transport` moves framed
//! envelopes between real nodes.

pub mod context;
pub mod envelope;
pub mod lease;
pub mod log;
pub mod paxos;
pub mod quorum;
pub mod store;
pub mod transport;
pub mod wire;

pub use context::QuorumContext;
pub use envelope::{Envelope, Outbox, PeerMessage, SendTo};
pub use lease::{LeaseEvent, LeaseMessage, PaxosLease, DEFAULT_LEASE_DURATION_MS};
pub use log::{LogState, ReplicatedLog, DEFAULT_PAXOS_TIMEOUT_MS};
pub use paxos::PaxosMessage;
pub use quorum::Quorum;
pub use store::{AcceptorState, FileReplicationStore, MemoryReplicationStore, ReplicationStore};
pub use transport::{ClusterTransport, IncomingMessage, PeerAddress, TransportConfig};
