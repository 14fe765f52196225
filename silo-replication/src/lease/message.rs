//! PaxosLease message set, ASCII framed.

use anyhow::{bail, Error};

use silo_api_types::NodeId;

use crate::wire::{MessageReader, MessageWriter};

const PREPARE_REQUEST: u8 = b'1';
const PREPARE_REJECTED: u8 = b'2';
const PREPARE_PREVIOUSLY_ACCEPTED: u8 = b'3';
const PREPARE_CURRENTLY_OPEN: u8 = b'4';
const PROPOSE_REQUEST: u8 = b'5';
const PROPOSE_REJECTED: u8 = b'6';
const PROPOSE_ACCEPTED: u8 = b'7';
const LEARN_CHOSEN: u8 = b'8';

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseMessage {
    PrepareRequest {
        node_id: NodeId,
        proposal_id: u64,
        /// Proposer's replicated-log position, a catchup hint for learners.
        paxos_id: u64,
    },
    PrepareRejected {
        node_id: NodeId,
        proposal_id: u64,
    },
    /// Some acceptor already granted an unexpired lease.
    PreparePreviouslyAccepted {
        node_id: NodeId,
        proposal_id: u64,
        accepted_proposal_id: u64,
        lease_owner: NodeId,
        duration: u64,
    },
    PrepareCurrentlyOpen {
        node_id: NodeId,
        proposal_id: u64,
    },
    ProposeRequest {
        node_id: NodeId,
        proposal_id: u64,
        lease_owner: NodeId,
        duration: u64,
    },
    ProposeRejected {
        node_id: NodeId,
        proposal_id: u64,
    },
    ProposeAccepted {
        node_id: NodeId,
        proposal_id: u64,
    },
    LearnChosen {
        node_id: NodeId,
        lease_owner: NodeId,
        duration: u64,
        /// Owner-local expiry; meaningful only on the owner itself.
        local_expire_time: u64,
    },
}

impl LeaseMessage {
    pub fn node_id(&self) -> NodeId {
        match self {
            LeaseMessage::PrepareRequest { node_id, .. }
            | LeaseMessage::PrepareRejected { node_id, .. }
            | LeaseMessage::PreparePreviouslyAccepted { node_id, .. }
            | LeaseMessage::PrepareCurrentlyOpen { node_id, .. }
            | LeaseMessage::ProposeRequest { node_id, .. }
            | LeaseMessage::ProposeRejected { node_id, .. }
            | LeaseMessage::ProposeAccepted { node_id, .. }
            | LeaseMessage::LearnChosen { node_id, .. } => *node_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        match self {
            LeaseMessage::PrepareRequest {
                node_id,
                proposal_id,
                paxos_id,
            } => {
                w.field_char(PREPARE_REQUEST)
                    .field_u64(*node_id)
                    .field_u64(*proposal_id)
                    .field_u64(*paxos_id);
            }
            LeaseMessage::PrepareRejected {
                node_id,
                proposal_id,
            } => {
                w.field_char(PREPARE_REJECTED)
                    .field_u64(*node_id)
                    .field_u64(*proposal_id);
            }
            LeaseMessage::PreparePreviouslyAccepted {
                node_id,
                proposal_id,
                accepted_proposal_id,
                lease_owner,
                duration,
            } => {
                w.field_char(PREPARE_PREVIOUSLY_ACCEPTED)
                    .field_u64(*node_id)
                    .field_u64(*proposal_id)
                    .field_u64(*accepted_proposal_id)
                    .field_u64(*lease_owner)
                    .field_u64(*duration);
            }
            LeaseMessage::PrepareCurrentlyOpen {
                node_id,
                proposal_id,
            } => {
                w.field_char(PREPARE_CURRENTLY_OPEN)
                    .field_u64(*node_id)
                    .field_u64(*proposal_id);
            }
            LeaseMessage::ProposeRequest {
                node_id,
                proposal_id,
                lease_owner,
                duration,
            } => {
                w.field_char(PROPOSE_REQUEST)
                    .field_u64(*node_id)
                    .field_u64(*proposal_id)
                    .field_u64(*lease_owner)
                    .field_u64(*duration);
            }
            LeaseMessage::ProposeRejected {
                node_id,
                proposal_id,
            } => {
                w.field_char(PROPOSE_REJECTED)
                    .field_u64(*node_id)
                    .field_u64(*proposal_id);
            }
            LeaseMessage::ProposeAccepted {
                node_id,
                proposal_id,
            } => {
                w.field_char(PROPOSE_ACCEPTED)
                    .field_u64(*node_id)
                    .field_u64(*proposal_id);
            }
            LeaseMessage::LearnChosen {
                node_id,
                lease_owner,
                duration,
                local_expire_time,
            } => {
                w.field_char(LEARN_CHOSEN)
                    .field_u64(*node_id)
                    .field_u64(*lease_owner)
                    .field_u64(*duration)
                    .field_u64(*local_expire_time);
            }
        }
        w.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut r = MessageReader::new(data);
        let kind = r.read_char()?;
        let node_id = r.read_u64()?;

        let msg = match kind {
            PREPARE_REQUEST => LeaseMessage::PrepareRequest {
                node_id,
                proposal_id: r.read_u64()?,
                paxos_id: r.read_u64()?,
            },
            PREPARE_REJECTED => LeaseMessage::PrepareRejected {
                node_id,
                proposal_id: r.read_u64()?,
            },
            PREPARE_PREVIOUSLY_ACCEPTED => LeaseMessage::PreparePreviouslyAccepted {
                node_id,
                proposal_id: r.read_u64()?,
                accepted_proposal_id: r.read_u64()?,
                lease_owner: r.read_u64()?,
                duration: r.read_u64()?,
            },
            PREPARE_CURRENTLY_OPEN => LeaseMessage::PrepareCurrentlyOpen {
                node_id,
                proposal_id: r.read_u64()?,
            },
            PROPOSE_REQUEST => LeaseMessage::ProposeRequest {
                node_id,
                proposal_id: r.read_u64()?,
                lease_owner: r.read_u64()?,
                duration: r.read_u64()?,
            },
            PROPOSE_REJECTED => LeaseMessage::ProposeRejected {
                node_id,
                proposal_id: r.read_u64()?,
            },
            PROPOSE_ACCEPTED => LeaseMessage::ProposeAccepted {
                node_id,
                proposal_id: r.read_u64()?,
            },
            LEARN_CHOSEN => LeaseMessage::LearnChosen {
                node_id,
                lease_owner: r.read_u64()?,
                duration: r.read_u64()?,
                local_expire_time: r.read_u64()?,
            },
            other => bail!("unknown lease message type {:#x}", other),
        };
        r.expect_end()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let messages = [
            LeaseMessage::PrepareRequest {
                node_id: 1,
                proposal_id: 65537,
                paxos_id: 12,
            },
            LeaseMessage::PreparePreviouslyAccepted {
                node_id: 2,
                proposal_id: 65538,
                accepted_proposal_id: 65537,
                lease_owner: 1,
                duration: 7000,
            },
            LeaseMessage::LearnChosen {
                node_id: 3,
                lease_owner: 3,
                duration: 7000,
                local_expire_time: 123456,
            },
        ];
        for msg in messages {
            assert_eq!(LeaseMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }
}
