//! PaxosLease proposer role.
//!
//! Acquires the lease with a paxos-style two-phase vote. The local expire
//! time is fixed when the propose phase starts, before any acceptor grants,
//! so the owner's view of the lease is always the most conservative one.
//!
//! A proposer only ever proposes itself. If phase 1 reveals a live lease
//! held by another node the round is abandoned and retried after a
//! randomized backoff; an acceptor reporting the proposer's *own* live
//! grant counts as open, which is how the owner re-votes before expiry.

use std::collections::HashSet;

use rand::Rng;

use silo_api_types::NodeId;

use crate::envelope::{Outbox, PeerMessage};
use crate::quorum::{next_proposal_id, proposal_id, Quorum};

use super::message::LeaseMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Preparing,
    Proposing,
    Backoff,
}

/// A successfully acquired lease, to be learned by the quorum.
#[derive(Debug, PartialEq, Eq)]
pub struct AcquiredLease {
    pub duration: u64,
    pub local_expire_time: u64,
}

pub struct PaxosLeaseProposer {
    node_id: NodeId,
    duration_ms: u64,
    timeout_ms: u64,
    restart_counter: u64,
    phase: Phase,
    proposal_id: u64,
    highest_observed_proposal_id: u64,
    propose_start: u64,
    granted: HashSet<NodeId>,
    accepted: HashSet<NodeId>,
    timeout_at: Option<u64>,
}

impl PaxosLeaseProposer {
    pub fn new(node_id: NodeId, restart_counter: u64, duration_ms: u64, timeout_ms: u64) -> Self {
        Self {
            node_id,
            duration_ms,
            timeout_ms,
            restart_counter,
            phase: Phase::Idle,
            proposal_id: 0,
            highest_observed_proposal_id: 0,
            propose_start: 0,
            granted: HashSet::new(),
            accepted: HashSet::new(),
            timeout_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn next_timeout(&self) -> Option<u64> {
        self.timeout_at
    }

    fn bump_proposal_id(&mut self) {
        self.proposal_id = if self.proposal_id == 0 {
            proposal_id(self.restart_counter, self.node_id)
        } else {
            next_proposal_id(
                self.proposal_id.max(self.highest_observed_proposal_id),
                self.node_id,
            )
        };
    }

    /// Start (or restart) the acquisition vote.
    pub fn start_acquire(&mut self, paxos_id_hint: u64, out: &mut Outbox, now: u64) {
        self.bump_proposal_id();
        self.phase = Phase::Preparing;
        self.granted.clear();
        self.accepted.clear();
        self.timeout_at = Some(now + self.timeout_ms);

        out.broadcast(PeerMessage::Lease(LeaseMessage::PrepareRequest {
            node_id: self.node_id,
            proposal_id: self.proposal_id,
            paxos_id: paxos_id_hint,
        }));
    }

    fn enter_backoff(&mut self, now: u64) {
        self.phase = Phase::Backoff;
        let jitter = rand::thread_rng().gen_range(0..self.timeout_ms.max(1));
        self.timeout_at = Some(now + jitter);
    }

    pub fn on_message(
        &mut self,
        msg: &LeaseMessage,
        quorum: &Quorum,
        out: &mut Outbox,
        now: u64,
    ) -> Option<AcquiredLease> {
        match msg {
            LeaseMessage::PrepareCurrentlyOpen {
                node_id,
                proposal_id,
            } => {
                if self.phase == Phase::Preparing && *proposal_id == self.proposal_id {
                    self.granted.insert(*node_id);
                    if self.granted.len() >= quorum.majority() {
                        self.start_propose(out, now);
                    }
                }
            }
            LeaseMessage::PreparePreviouslyAccepted {
                node_id,
                proposal_id,
                accepted_proposal_id,
                lease_owner,
                ..
            } => {
                self.observe(*accepted_proposal_id);
                if self.phase == Phase::Preparing && *proposal_id == self.proposal_id {
                    if *lease_owner == self.node_id {
                        // our own live grant is as good as open; the propose
                        // phase refreshes it
                        self.granted.insert(*node_id);
                        if self.granted.len() >= quorum.majority() {
                            self.start_propose(out, now);
                        }
                    } else {
                        // someone else holds a live lease; try again later
                        self.enter_backoff(now);
                    }
                }
            }
            LeaseMessage::PrepareRejected { proposal_id, .. } => {
                self.observe(*proposal_id);
                if self.phase == Phase::Preparing && *proposal_id == self.proposal_id {
                    self.enter_backoff(now);
                }
            }
            LeaseMessage::ProposeAccepted {
                node_id,
                proposal_id,
            } => {
                if self.phase == Phase::Proposing && *proposal_id == self.proposal_id {
                    self.accepted.insert(*node_id);
                    if self.accepted.len() >= quorum.majority() {
                        self.phase = Phase::Idle;
                        self.timeout_at = None;
                        return Some(AcquiredLease {
                            duration: self.duration_ms,
                            local_expire_time: self.propose_start + self.duration_ms,
                        });
                    }
                }
            }
            LeaseMessage::ProposeRejected { proposal_id, .. } => {
                self.observe(*proposal_id);
                if self.phase == Phase::Proposing && *proposal_id == self.proposal_id {
                    self.enter_backoff(now);
                }
            }
            _ => {}
        }
        None
    }

    fn start_propose(&mut self, out: &mut Outbox, now: u64) {
        self.phase = Phase::Proposing;
        self.propose_start = now;
        self.accepted.clear();
        self.timeout_at = Some(now + self.timeout_ms);

        out.broadcast(PeerMessage::Lease(LeaseMessage::ProposeRequest {
            node_id: self.node_id,
            proposal_id: self.proposal_id,
            lease_owner: self.node_id,
            duration: self.duration_ms,
        }));
    }

    fn observe(&mut self, proposal_id: u64) {
        if proposal_id > self.highest_observed_proposal_id {
            self.highest_observed_proposal_id = proposal_id;
        }
    }

    /// Returns true when the round should be restarted.
    pub fn on_timeout(&mut self, now: u64) -> bool {
        match self.timeout_at {
            Some(at) if now >= at && self.phase != Phase::Idle => {
                self.timeout_at = None;
                self.phase = Phase::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn stop(&mut self) {
        self.phase = Phase::Idle;
        self.timeout_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::acceptor::PaxosLeaseAcceptor;

    fn respond_all(
        proposer: &mut PaxosLeaseProposer,
        acceptors: &mut [PaxosLeaseAcceptor],
        quorum: &Quorum,
        out: &mut Outbox,
        now: u64,
    ) -> Option<AcquiredLease> {
        // feed every queued broadcast through all acceptors until quiet
        loop {
            let envelopes = out.drain();
            if envelopes.is_empty() {
                return None;
            }
            for envelope in envelopes {
                let msg = match &envelope.message {
                    PeerMessage::Lease(msg) => msg.clone(),
                    _ => continue,
                };
                let replies: Vec<LeaseMessage> = acceptors
                    .iter_mut()
                    .map(|acceptor| match &msg {
                        LeaseMessage::PrepareRequest { proposal_id, .. } => {
                            acceptor.on_prepare_request(*proposal_id, now)
                        }
                        LeaseMessage::ProposeRequest {
                            proposal_id,
                            lease_owner,
                            duration,
                            ..
                        } => acceptor.on_propose_request(
                            *proposal_id,
                            *lease_owner,
                            *duration,
                            now,
                        ),
                        _ => unreachable!(),
                    })
                    .collect();
                for reply in replies {
                    if let Some(acquired) = proposer.on_message(&reply, quorum, out, now) {
                        return Some(acquired);
                    }
                }
            }
        }
    }

    #[test]
    fn acquire_and_revote() {
        let quorum = Quorum::new(1, vec![1, 2, 3]);
        let mut out = Outbox::new();
        let mut proposer = PaxosLeaseProposer::new(1, 1, 7000, 2000);
        let mut acceptors = vec![
            PaxosLeaseAcceptor::new(1, 7000, 0),
            PaxosLeaseAcceptor::new(2, 7000, 0),
            PaxosLeaseAcceptor::new(3, 7000, 0),
        ];

        // initial acquisition, past the acceptor grace
        let t0 = 8000;
        proposer.start_acquire(0, &mut out, t0);
        let acquired = respond_all(&mut proposer, &mut acceptors, &quorum, &mut out, t0).unwrap();
        assert_eq!(acquired.local_expire_time, t0 + 7000);

        // re-vote before expiry: own grants count as open
        let t1 = t0 + 5000;
        proposer.start_acquire(0, &mut out, t1);
        let renewed = respond_all(&mut proposer, &mut acceptors, &quorum, &mut out, t1).unwrap();
        assert_eq!(renewed.local_expire_time, t1 + 7000);
    }

    #[test]
    fn foreign_live_lease_backs_off() {
        let quorum = Quorum::new(2, vec![1, 2, 3]);
        let mut out = Outbox::new();
        let mut proposer = PaxosLeaseProposer::new(2, 1, 7000, 2000);
        let mut acceptors = vec![
            PaxosLeaseAcceptor::new(1, 7000, 0),
            PaxosLeaseAcceptor::new(2, 7000, 0),
            PaxosLeaseAcceptor::new(3, 7000, 0),
        ];

        // node 1 already holds the lease on all acceptors
        let t0 = 8000;
        for acceptor in acceptors.iter_mut() {
            acceptor.on_prepare_request(65537, t0);
            acceptor.on_propose_request(65537, 1, 7000, t0);
        }

        proposer.start_acquire(0, &mut out, t0 + 100);
        let acquired =
            respond_all(&mut proposer, &mut acceptors, &quorum, &mut out, t0 + 100);
        assert_eq!(acquired, None);
        assert!(proposer.next_timeout().is_some()); // backoff armed

        // after the grants expired the same candidate wins
        let t1 = t0 + 8000;
        assert!(proposer.on_timeout(t1));
        proposer.start_acquire(0, &mut out, t1);
        let acquired = respond_all(&mut proposer, &mut acceptors, &quorum, &mut out, t1);
        assert!(acquired.is_some());
    }
}
