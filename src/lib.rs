//! Silodb: a replicated, sharded key-value store.
//!
//! The heavy lifting lives in the workspace crates: `silo-storage` is the
//! log-structured shard storage engine (log segments, memo and file chunks,
//! page cache, crash recovery) and `silo-replication` the paxos replicated
//! log with its PaxosLease leader lease and cluster transport. This crate
//! glues one quorum's replication onto one node's storage environment and
//! runs the event loop.
//!
//! The client wire protocol and the control plane (placement, migration,
//! membership) are separate services; they talk to this core through the
//! [`shard::ShardQuorum`] surface.

pub mod config;
pub mod server;
pub mod shard;

pub use config::NodeConfig;
pub use server::Server;
pub use shard::ShardQuorum;
