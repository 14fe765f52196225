//! PaxosLease: time-bounded leader election over the paxos acceptor set.
//!
//! A candidate runs a two-phase vote; on acceptance by a majority it holds
//! the lease for `duration` milliseconds of its own clock, counted from
//! before the propose phase started. Leases are never extended; the owner
//! re-votes before expiry. No two owners can overlap as long as clock drift
//! stays under the safety margin and message delay under the duration.

pub mod acceptor;
pub mod learner;
pub mod message;
pub mod proposer;

pub use acceptor::PaxosLeaseAcceptor;
pub use learner::{PaxosLeaseLearner, LEASE_SAFETY_MARGIN_MS};
pub use message::LeaseMessage;
pub use proposer::PaxosLeaseProposer;

use silo_api_types::NodeId;

use crate::envelope::{Outbox, PeerMessage};
use crate::quorum::Quorum;

pub const DEFAULT_LEASE_DURATION_MS: u64 = 7000;
pub const DEFAULT_LEASE_TIMEOUT_MS: u64 = 2000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseEvent {
    LearnLease,
    LeaseTimeout,
}

/// One node's view of the lease protocol: proposer, acceptor and learner
/// wired together.
pub struct PaxosLease {
    quorum: Quorum,
    duration_ms: u64,
    proposer: PaxosLeaseProposer,
    acceptor: PaxosLeaseAcceptor,
    learner: PaxosLeaseLearner,
}

impl PaxosLease {
    pub fn new(quorum: Quorum, restart_counter: u64, duration_ms: u64, now: u64) -> Self {
        let node_id = quorum.node_id();
        Self {
            proposer: PaxosLeaseProposer::new(
                node_id,
                restart_counter,
                duration_ms,
                DEFAULT_LEASE_TIMEOUT_MS,
            ),
            acceptor: PaxosLeaseAcceptor::new(node_id, duration_ms, now),
            learner: PaxosLeaseLearner::new(node_id),
            quorum,
            duration_ms,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.quorum.node_id()
    }

    pub fn is_lease_owner(&mut self, now: u64) -> bool {
        self.learner.is_lease_owner(now)
    }

    pub fn is_lease_known(&mut self, now: u64) -> bool {
        self.learner.is_lease_known(now)
    }

    pub fn lease_owner(&mut self, now: u64) -> Option<NodeId> {
        self.learner.lease_owner(now)
    }

    pub fn lease_epoch(&self) -> u64 {
        self.learner.lease_epoch()
    }

    /// Drive timers: lease expiry, proposal rounds, acquisition and the
    /// pre-expiry re-vote. Call on startup and whenever `next_timeout` fires.
    pub fn tick(&mut self, paxos_id_hint: u64, out: &mut Outbox, now: u64) -> Vec<LeaseEvent> {
        let mut events = self.learner.check_lease(now);

        if self.proposer.on_timeout(now) {
            self.proposer.start_acquire(paxos_id_hint, out, now);
            return events;
        }

        if !self.proposer.is_active() {
            let revote = match self.learner.expire_time() {
                // re-vote while the old lease is still comfortably valid
                Some(expire) if self.learner.is_lease_owner(now) => {
                    now + self.duration_ms / 4 >= expire
                }
                Some(_) => false,
                None => true,
            };
            if revote {
                self.proposer.start_acquire(paxos_id_hint, out, now);
            }
        }

        events
    }

    pub fn next_timeout(&self) -> Option<u64> {
        let mut next = self.proposer.next_timeout();
        if let Some(expire) = self.learner.expire_time() {
            // the owner wakes up early enough to re-vote before expiry
            let at = if self.learner.peek_owner() == Some(self.quorum.node_id()) {
                expire.saturating_sub(self.duration_ms / 4)
            } else {
                expire
            };
            next = Some(next.map_or(at, |t| t.min(at)));
        }
        next
    }

    pub fn on_message(&mut self, msg: &LeaseMessage, out: &mut Outbox, now: u64) -> Vec<LeaseEvent> {
        match msg {
            LeaseMessage::PrepareRequest {
                node_id,
                proposal_id,
                ..
            } => {
                let reply = self.acceptor.on_prepare_request(*proposal_id, now);
                out.send_to(*node_id, PeerMessage::Lease(reply));
                Vec::new()
            }
            LeaseMessage::ProposeRequest {
                node_id,
                proposal_id,
                lease_owner,
                duration,
            } => {
                let reply =
                    self.acceptor
                        .on_propose_request(*proposal_id, *lease_owner, *duration, now);
                out.send_to(*node_id, PeerMessage::Lease(reply));
                Vec::new()
            }
            LeaseMessage::LearnChosen { .. } => self.learner.on_learn_chosen(msg, now),
            response => {
                if let Some(acquired) = self.proposer.on_message(response, &self.quorum, out, now)
                {
                    let learn = LeaseMessage::LearnChosen {
                        node_id: self.node_id(),
                        lease_owner: self.node_id(),
                        duration: acquired.duration,
                        local_expire_time: acquired.local_expire_time,
                    };
                    out.broadcast(PeerMessage::Lease(learn.clone()));
                    return self.learner.on_learn_chosen(&learn, now);
                }
                Vec::new()
            }
        }
    }
}
