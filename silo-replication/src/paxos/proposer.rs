//! Paxos proposer role.
//!
//! Runs one proposal round at a time for the current instance. On rejection
//! or timeout the round is abandoned and retried with a higher proposal id
//! after a randomized backoff; while the same node holds the lease the log
//! skips phase 1 entirely and the proposer goes straight to proposing.

use std::collections::HashSet;

use rand::Rng;

use silo_api_types::NodeId;

use crate::envelope::{Outbox, PeerMessage};
use crate::quorum::{next_proposal_id, proposal_id, Quorum};

use super::message::PaxosMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Preparing,
    Proposing,
    /// Round lost; waiting out the randomized backoff before retrying.
    Backoff,
}

/// Outcome of feeding a response into the proposer.
#[derive(Debug, PartialEq, Eq)]
pub enum ProposerEvent {
    None,
    /// A majority accepted; the carried value is chosen.
    Chosen(Vec<u8>),
}

pub struct PaxosProposer {
    node_id: NodeId,
    restart_counter: u64,
    timeout_ms: u64,
    phase: Phase,
    proposal_id: u64,
    highest_observed_proposal_id: u64,
    /// Value this round drives; may be replaced by a previously accepted one.
    value: Vec<u8>,
    highest_accepted_proposal_id: u64,
    granted: HashSet<NodeId>,
    accepted: HashSet<NodeId>,
    timeout_at: Option<u64>,
}

impl PaxosProposer {
    pub fn new(node_id: NodeId, restart_counter: u64, timeout_ms: u64) -> Self {
        Self {
            node_id,
            restart_counter,
            timeout_ms,
            phase: Phase::Idle,
            proposal_id: 0,
            highest_observed_proposal_id: 0,
            value: Vec::new(),
            highest_accepted_proposal_id: 0,
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

    /// The value the current round is driving.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    fn bump_proposal_id(&mut self) {
        let base = if self.proposal_id == 0 {
            proposal_id(self.restart_counter, self.node_id)
        } else {
            next_proposal_id(
                self.proposal_id.max(self.highest_observed_proposal_id),
                self.node_id,
            )
        };
        self.proposal_id = base.max(self.proposal_id);
    }

    /// Begin a full round (phase 1) for `paxos_id`.
    pub fn start_prepare(&mut self, paxos_id: u64, value: Vec<u8>, out: &mut Outbox, now: u64) {
        self.bump_proposal_id();
        self.phase = Phase::Preparing;
        self.value = value;
        self.highest_accepted_proposal_id = 0;
        self.granted.clear();
        self.accepted.clear();
        self.timeout_at = Some(now + self.timeout_ms);

        out.broadcast(PeerMessage::Paxos(PaxosMessage::PrepareRequest {
            node_id: self.node_id,
            paxos_id,
            proposal_id: self.proposal_id,
        }));
    }

    /// Skip phase 1 (lease-holder fast path) and propose directly.
    pub fn start_propose(&mut self, paxos_id: u64, value: Vec<u8>, out: &mut Outbox, now: u64) {
        if self.proposal_id == 0 {
            self.proposal_id = proposal_id(self.restart_counter, self.node_id);
        }
        self.phase = Phase::Proposing;
        self.value = value;
        self.accepted.clear();
        self.timeout_at = Some(now + self.timeout_ms);

        out.broadcast(PeerMessage::Paxos(PaxosMessage::ProposeRequest {
            node_id: self.node_id,
            paxos_id,
            proposal_id: self.proposal_id,
            value: self.value.clone(),
        }));
    }

    fn enter_backoff(&mut self, now: u64) {
        self.phase = Phase::Backoff;
        let jitter = rand::thread_rng().gen_range(0..self.timeout_ms.max(1));
        self.timeout_at = Some(now + self.timeout_ms / 2 + jitter);
    }

    /// Feed a response belonging to the current instance.
    pub fn on_message(
        &mut self,
        paxos_id: u64,
        msg: &PaxosMessage,
        quorum: &Quorum,
        out: &mut Outbox,
        now: u64,
    ) -> ProposerEvent {
        match msg {
            PaxosMessage::PrepareCurrentlyOpen {
                node_id,
                proposal_id,
                ..
            } => {
                if self.phase == Phase::Preparing && *proposal_id == self.proposal_id {
                    self.granted.insert(*node_id);
                    self.maybe_propose(paxos_id, quorum, out, now);
                }
            }
            PaxosMessage::PreparePreviouslyAccepted {
                node_id,
                proposal_id,
                accepted_proposal_id,
                value,
                ..
            } => {
                if self.phase == Phase::Preparing && *proposal_id == self.proposal_id {
                    if *accepted_proposal_id > self.highest_accepted_proposal_id {
                        // a value may already be chosen; we must drive it
                        self.highest_accepted_proposal_id = *accepted_proposal_id;
                        self.value = value.clone();
                    }
                    self.granted.insert(*node_id);
                    self.maybe_propose(paxos_id, quorum, out, now);
                }
            }
            PaxosMessage::PrepareRejected {
                proposal_id,
                promised_proposal_id,
                ..
            } => {
                self.observe(*promised_proposal_id);
                if self.phase == Phase::Preparing && *proposal_id == self.proposal_id {
                    self.enter_backoff(now);
                }
            }
            PaxosMessage::ProposeAccepted {
                node_id,
                proposal_id,
                ..
            } => {
                if self.phase == Phase::Proposing && *proposal_id == self.proposal_id {
                    self.accepted.insert(*node_id);
                    if self.accepted.len() >= quorum.majority() {
                        self.phase = Phase::Idle;
                        self.timeout_at = None;
                        return ProposerEvent::Chosen(self.value.clone());
                    }
                }
            }
            PaxosMessage::ProposeRejected {
                proposal_id,
                promised_proposal_id,
                ..
            } => {
                self.observe(*promised_proposal_id);
                if self.phase == Phase::Proposing && *proposal_id == self.proposal_id {
                    self.enter_backoff(now);
                }
            }
            _ => {}
        }
        ProposerEvent::None
    }

    fn maybe_propose(&mut self, paxos_id: u64, quorum: &Quorum, out: &mut Outbox, now: u64) {
        if self.granted.len() >= quorum.majority() {
            let value = self.value.clone();
            self.start_propose(paxos_id, value, out, now);
        }
    }

    fn observe(&mut self, proposal_id: u64) {
        if proposal_id > self.highest_observed_proposal_id {
            self.highest_observed_proposal_id = proposal_id;
        }
    }

    /// Returns true when the round should be restarted (timeout or backoff
    /// elapsed). The caller restarts with `start_prepare`.
    pub fn on_timeout(&mut self, now: u64) -> bool {
        match self.timeout_at {
            Some(at) if now >= at && self.phase != Phase::Idle => {
                self.timeout_at = None;
                true
            }
            _ => false,
        }
    }

    /// Abandon the current round (lease lost, value chosen elsewhere).
    pub fn stop(&mut self) {
        self.phase = Phase::Idle;
        self.timeout_at = None;
        self.granted.clear();
        self.accepted.clear();
    }
}
