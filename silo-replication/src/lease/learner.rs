//! PaxosLease learner role.
//!
//! Tracks who holds the lease and until when. Non-owners shorten the learned
//! expiry by a fixed safety margin to absorb clock drift; the owner trusts
//! its own conservative local expire time.

use silo_api_types::NodeId;

use super::message::LeaseMessage;
use super::LeaseEvent;

/// Safety margin subtracted from the lease duration on non-owner learners.
pub const LEASE_SAFETY_MARGIN_MS: u64 = 500;

pub struct PaxosLeaseLearner {
    node_id: NodeId,
    learned: bool,
    lease_owner: NodeId,
    expire_time: u64,
    lease_epoch: u64,
}

impl PaxosLeaseLearner {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            learned: false,
            lease_owner: 0,
            expire_time: 0,
            lease_epoch: 0,
        }
    }

    pub fn on_learn_chosen(&mut self, msg: &LeaseMessage, now: u64) -> Vec<LeaseEvent> {
        let (lease_owner, duration, local_expire_time) = match msg {
            LeaseMessage::LearnChosen {
                lease_owner,
                duration,
                local_expire_time,
                ..
            } => (*lease_owner, *duration, *local_expire_time),
            _ => return Vec::new(),
        };

        let mut events = Vec::new();
        if self.learned && self.expire_time <= now {
            self.expire(&mut events);
        }

        let expire_time = if lease_owner == self.node_id {
            // our own vote carries the conservative local expiry
            local_expire_time
        } else {
            now + duration.saturating_sub(LEASE_SAFETY_MARGIN_MS)
        };

        if expire_time <= now {
            return events;
        }

        self.learned = true;
        self.lease_owner = lease_owner;
        self.expire_time = expire_time;
        log::debug!(
            "node {} has the lease for {} ms",
            lease_owner,
            expire_time - now
        );
        events.push(LeaseEvent::LearnLease);
        events
    }

    fn expire(&mut self, events: &mut Vec<LeaseEvent>) {
        self.learned = false;
        self.lease_owner = 0;
        self.expire_time = 0;
        self.lease_epoch += 1;
        events.push(LeaseEvent::LeaseTimeout);
    }

    /// Lazily expire the lease; returns a timeout event when it just did.
    pub fn check_lease(&mut self, now: u64) -> Vec<LeaseEvent> {
        let mut events = Vec::new();
        if self.learned && self.expire_time <= now {
            self.expire(&mut events);
        }
        events
    }

    pub fn is_lease_owner(&mut self, now: u64) -> bool {
        self.check_lease(now);
        self.learned && self.lease_owner == self.node_id
    }

    pub fn is_lease_known(&mut self, now: u64) -> bool {
        self.check_lease(now);
        self.learned
    }

    pub fn lease_owner(&mut self, now: u64) -> Option<NodeId> {
        self.check_lease(now);
        if self.learned {
            Some(self.lease_owner)
        } else {
            None
        }
    }

    pub fn lease_epoch(&self) -> u64 {
        self.lease_epoch
    }

    /// Current owner without checking expiry; for timer scheduling only.
    pub fn peek_owner(&self) -> Option<NodeId> {
        if self.learned {
            Some(self.lease_owner)
        } else {
            None
        }
    }

    pub fn expire_time(&self) -> Option<u64> {
        if self.learned {
            Some(self.expire_time)
        } else {
            None
        }
    }
}
