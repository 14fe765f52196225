//! Paxos learner role.
//!
//! Thin by design: chosen values are applied by the replicated log the
//! moment a `LearnChosen` arrives. The learner only tracks when we last
//! learned something and rate-limits `RequestChosen` probes to lagging-free
//! peers.

use silo_api_types::NodeId;

use crate::envelope::{Outbox, PeerMessage};

use super::message::PaxosMessage;

/// Minimum spacing between catchup probes for the same instance.
const REQUEST_CHOSEN_INTERVAL_MS: u64 = 500;

pub struct PaxosLearner {
    node_id: NodeId,
    last_learn_time: u64,
    last_request: Option<(u64, u64)>, // (paxos_id, sent_at)
}

impl PaxosLearner {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            last_learn_time: 0,
            last_request: None,
        }
    }

    pub fn last_learn_time(&self) -> u64 {
        self.last_learn_time
    }

    pub fn note_learned(&mut self, now: u64) {
        self.last_learn_time = now;
        self.last_request = None;
    }

    /// Ask `from` for the chosen value of `paxos_id`, at most once per
    /// interval.
    pub fn request_chosen(&mut self, from: NodeId, paxos_id: u64, out: &mut Outbox, now: u64) {
        if let Some((requested_id, sent_at)) = self.last_request {
            if requested_id == paxos_id && now < sent_at + REQUEST_CHOSEN_INTERVAL_MS {
                return;
            }
        }
        self.last_request = Some((paxos_id, now));
        out.send_to(
            from,
            PeerMessage::Paxos(PaxosMessage::RequestChosen {
                node_id: self.node_id,
                paxos_id,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_chosen_is_rate_limited() {
        let mut learner = PaxosLearner::new(1);
        let mut out = Outbox::new();

        learner.request_chosen(2, 10, &mut out, 0);
        learner.request_chosen(2, 10, &mut out, 100);
        assert_eq!(out.drain().len(), 1);

        // different instance or elapsed interval sends again
        learner.request_chosen(2, 11, &mut out, 150);
        learner.request_chosen(2, 11, &mut out, 150 + REQUEST_CHOSEN_INTERVAL_MS);
        assert_eq!(out.drain().len(), 2);
    }
}
