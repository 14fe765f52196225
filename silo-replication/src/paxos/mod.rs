//! Classic single-decree paxos over numbered instances.
//!
//! The proposer, acceptor and learner roles are separate state machines;
//! the replicated log owns one of each and routes messages between them and
//! the quorum.

pub mod acceptor;
pub mod learner;
pub mod message;
pub mod proposer;

pub use acceptor::PaxosAcceptor;
pub use learner::PaxosLearner;
pub use message::PaxosMessage;
pub use proposer::{PaxosProposer, ProposerEvent};
