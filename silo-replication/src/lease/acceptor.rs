//! PaxosLease acceptor role.
//!
//! Lease grants are bounded by the acceptor's local clock and are not
//! persisted; instead a restarting acceptor sits out one full lease duration
//! before granting anything, so a grant lost to a crash cannot be
//! contradicted within its lifetime.

use silo_api_types::NodeId;

use super::message::LeaseMessage;

#[derive(Clone, Debug)]
struct AcceptedLease {
    proposal_id: u64,
    lease_owner: NodeId,
    duration: u64,
    local_expire_time: u64,
}

pub struct PaxosLeaseAcceptor {
    node_id: NodeId,
    /// No grants before this local time (restart grace).
    grace_until: u64,
    promised_proposal_id: u64,
    accepted: Option<AcceptedLease>,
}

impl PaxosLeaseAcceptor {
    pub fn new(node_id: NodeId, duration_ms: u64, now: u64) -> Self {
        Self {
            node_id,
            grace_until: now + duration_ms,
            promised_proposal_id: 0,
            accepted: None,
        }
    }

    fn check_expiry(&mut self, now: u64) {
        if let Some(accepted) = &self.accepted {
            if accepted.local_expire_time <= now {
                self.accepted = None;
                self.promised_proposal_id = 0;
            }
        }
    }

    pub fn on_prepare_request(&mut self, proposal_id: u64, now: u64) -> LeaseMessage {
        self.check_expiry(now);

        if now < self.grace_until || proposal_id < self.promised_proposal_id {
            return LeaseMessage::PrepareRejected {
                node_id: self.node_id,
                proposal_id,
            };
        }

        self.promised_proposal_id = proposal_id;
        match &self.accepted {
            Some(accepted) => LeaseMessage::PreparePreviouslyAccepted {
                node_id: self.node_id,
                proposal_id,
                accepted_proposal_id: accepted.proposal_id,
                lease_owner: accepted.lease_owner,
                duration: accepted.duration,
            },
            None => LeaseMessage::PrepareCurrentlyOpen {
                node_id: self.node_id,
                proposal_id,
            },
        }
    }

    pub fn on_propose_request(
        &mut self,
        proposal_id: u64,
        lease_owner: NodeId,
        duration: u64,
        now: u64,
    ) -> LeaseMessage {
        self.check_expiry(now);

        if now < self.grace_until || proposal_id < self.promised_proposal_id {
            return LeaseMessage::ProposeRejected {
                node_id: self.node_id,
                proposal_id,
            };
        }

        self.accepted = Some(AcceptedLease {
            proposal_id,
            lease_owner,
            duration,
            local_expire_time: now + duration,
        });
        LeaseMessage::ProposeAccepted {
            node_id: self.node_id,
            proposal_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_expires_on_local_clock() {
        let mut acceptor = PaxosLeaseAcceptor::new(2, 7000, 0);

        // within the restart grace everything is rejected
        assert!(matches!(
            acceptor.on_prepare_request(100, 1000),
            LeaseMessage::PrepareRejected { .. }
        ));

        let now = 7000;
        assert!(matches!(
            acceptor.on_prepare_request(100, now),
            LeaseMessage::PrepareCurrentlyOpen { .. }
        ));
        assert!(matches!(
            acceptor.on_propose_request(100, 1, 7000, now),
            LeaseMessage::ProposeAccepted { .. }
        ));

        // while the grant is live, a prepare sees the accepted lease
        match acceptor.on_prepare_request(200, now + 1000) {
            LeaseMessage::PreparePreviouslyAccepted { lease_owner, .. } => {
                assert_eq!(lease_owner, 1)
            }
            other => panic!("unexpected reply {:?}", other),
        }

        // after expiry the slot is open again, even to lower proposal ids
        assert!(matches!(
            acceptor.on_prepare_request(150, now + 8000),
            LeaseMessage::PrepareCurrentlyOpen { .. }
        ));
    }
}
