//! Paxos message set, ASCII framed.
//!
//! Every message carries the sender's node id and the paxos instance it
//! belongs to. Values are length-prefixed binary.

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
const REQUEST_CHOSEN: u8 = b'9';

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaxosMessage {
    PrepareRequest {
        node_id: NodeId,
        paxos_id: u64,
        proposal_id: u64,
    },
    PrepareRejected {
        node_id: NodeId,
        paxos_id: u64,
        proposal_id: u64,
        promised_proposal_id: u64,
    },
    /// Promise with a previously accepted value the proposer must adopt.
    PreparePreviouslyAccepted {
        node_id: NodeId,
        paxos_id: u64,
        proposal_id: u64,
        accepted_proposal_id: u64,
        value: Vec<u8>,
    },
    /// Promise with nothing accepted so far.
    PrepareCurrentlyOpen {
        node_id: NodeId,
        paxos_id: u64,
        proposal_id: u64,
    },
    ProposeRequest {
        node_id: NodeId,
        paxos_id: u64,
        proposal_id: u64,
        value: Vec<u8>,
    },
    ProposeRejected {
        node_id: NodeId,
        paxos_id: u64,
        proposal_id: u64,
        promised_proposal_id: u64,
    },
    ProposeAccepted {
        node_id: NodeId,
        paxos_id: u64,
        proposal_id: u64,
    },
    LearnChosen {
        node_id: NodeId,
        paxos_id: u64,
        value: Vec<u8>,
    },
    RequestChosen {
        node_id: NodeId,
        paxos_id: u64,
    },
}

impl PaxosMessage {
    pub fn node_id(&self) -> NodeId {
        match self {
            PaxosMessage::PrepareRequest { node_id, .. }
            | PaxosMessage::PrepareRejected { node_id, .. }
            | PaxosMessage::PreparePreviouslyAccepted { node_id, .. }
            | PaxosMessage::PrepareCurrentlyOpen { node_id, .. }
            | PaxosMessage::ProposeRequest { node_id, .. }
            | PaxosMessage::ProposeRejected { node_id, .. }
            | PaxosMessage::ProposeAccepted { node_id, .. }
            | PaxosMessage::LearnChosen { node_id, .. }
            | PaxosMessage::RequestChosen { node_id, .. } => *node_id,
        }
    }

    pub fn paxos_id(&self) -> u64 {
        match self {
            PaxosMessage::PrepareRequest { paxos_id, .. }
            | PaxosMessage::PrepareRejected { paxos_id, .. }
            | PaxosMessage::PreparePreviouslyAccepted { paxos_id, .. }
            | PaxosMessage::PrepareCurrentlyOpen { paxos_id, .. }
            | PaxosMessage::ProposeRequest { paxos_id, .. }
            | PaxosMessage::ProposeRejected { paxos_id, .. }
            | PaxosMessage::ProposeAccepted { paxos_id, .. }
            | PaxosMessage::LearnChosen { paxos_id, .. }
            | PaxosMessage::RequestChosen { paxos_id, .. } => *paxos_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        match self {
            PaxosMessage::PrepareRequest {
                node_id,
                paxos_id,
                proposal_id,
            } => {
                w.field_char(PREPARE_REQUEST)
                    .field_u64(*node_id)
                    .field_u64(*paxos_id)
                    .field_u64(*proposal_id);
            }
            PaxosMessage::PrepareRejected {
                node_id,
                paxos_id,
                proposal_id,
                promised_proposal_id,
            } => {
                w.field_char(PREPARE_REJECTED)
                    .field_u64(*node_id)
                    .field_u64(*paxos_id)
                    .field_u64(*proposal_id)
                    .field_u64(*promised_proposal_id);
            }
            PaxosMessage::PreparePreviouslyAccepted {
                node_id,
                paxos_id,
                proposal_id,
                accepted_proposal_id,
                value,
            } => {
                w.field_char(PREPARE_PREVIOUSLY_ACCEPTED)
                    .field_u64(*node_id)
                    .field_u64(*paxos_id)
                    .field_u64(*proposal_id)
                    .field_u64(*accepted_proposal_id)
                    .field_bytes(value);
            }
            PaxosMessage::PrepareCurrentlyOpen {
                node_id,
                paxos_id,
                proposal_id,
            } => {
                w.field_char(PREPARE_CURRENTLY_OPEN)
                    .field_u64(*node_id)
                    .field_u64(*paxos_id)
                    .field_u64(*proposal_id);
            }
            PaxosMessage::ProposeRequest {
                node_id,
                paxos_id,
                proposal_id,
                value,
            } => {
                w.field_char(PROPOSE_REQUEST)
                    .field_u64(*node_id)
                    .field_u64(*paxos_id)
                    .field_u64(*proposal_id)
                    .field_bytes(value);
            }
            PaxosMessage::ProposeRejected {
                node_id,
                paxos_id,
                proposal_id,
                promised_proposal_id,
            } => {
                w.field_char(PROPOSE_REJECTED)
                    .field_u64(*node_id)
                    .field_u64(*paxos_id)
                    .field_u64(*proposal_id)
                    .field_u64(*promised_proposal_id);
            }
            PaxosMessage::ProposeAccepted {
                node_id,
                paxos_id,
                proposal_id,
            } => {
                w.field_char(PROPOSE_ACCEPTED)
                    .field_u64(*node_id)
                    .field_u64(*paxos_id)
                    .field_u64(*proposal_id);
            }
            PaxosMessage::LearnChosen {
                node_id,
                paxos_id,
                value,
            } => {
                w.field_char(LEARN_CHOSEN)
                    .field_u64(*node_id)
                    .field_u64(*paxos_id)
                    .field_bytes(value);
            }
            PaxosMessage::RequestChosen { node_id, paxos_id } => {
                w.field_char(REQUEST_CHOSEN)
                    .field_u64(*node_id)
                    .field_u64(*paxos_id);
            }
        }
        w.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut r = MessageReader::new(data);
        let kind = r.read_char()?;
        let node_id = r.read_u64()?;
        let paxos_id = r.read_u64()?;

        let msg = match kind {
            PREPARE_REQUEST => PaxosMessage::PrepareRequest {
                node_id,
                paxos_id,
                proposal_id: r.read_u64()?,
            },
            PREPARE_REJECTED => PaxosMessage::PrepareRejected {
                node_id,
                paxos_id,
                proposal_id: r.read_u64()?,
                promised_proposal_id: r.read_u64()?,
            },
            PREPARE_PREVIOUSLY_ACCEPTED => PaxosMessage::PreparePreviouslyAccepted {
                node_id,
                paxos_id,
                proposal_id: r.read_u64()?,
                accepted_proposal_id: r.read_u64()?,
                value: r.read_bytes()?.to_vec(),
            },
            PREPARE_CURRENTLY_OPEN => PaxosMessage::PrepareCurrentlyOpen {
                node_id,
                paxos_id,
                proposal_id: r.read_u64()?,
            },
            PROPOSE_REQUEST => PaxosMessage::ProposeRequest {
                node_id,
                paxos_id,
                proposal_id: r.read_u64()?,
                value: r.read_bytes()?.to_vec(),
            },
            PROPOSE_REJECTED => PaxosMessage::ProposeRejected {
                node_id,
                paxos_id,
                proposal_id: r.read_u64()?,
                promised_proposal_id: r.read_u64()?,
            },
            PROPOSE_ACCEPTED => PaxosMessage::ProposeAccepted {
                node_id,
                paxos_id,
                proposal_id: r.read_u64()?,
            },
            LEARN_CHOSEN => PaxosMessage::LearnChosen {
                node_id,
                paxos_id,
                value: r.read_bytes()?.to_vec(),
            },
            REQUEST_CHOSEN => PaxosMessage::RequestChosen { node_id, paxos_id },
            other => bail!("unknown paxos message type {:#x}", other),
        };
        r.expect_end()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_carrying_messages_roundtrip() {
        let msg = PaxosMessage::ProposeRequest {
            node_id: 2,
            paxos_id: 44,
            proposal_id: 131074,
            value: b"binary\x00:value".to_vec(),
        };
        assert_eq!(PaxosMessage::decode(&msg.encode()).unwrap(), msg);

        let msg = PaxosMessage::PreparePreviouslyAccepted {
            node_id: 1,
            paxos_id: 44,
            proposal_id: 131074,
            accepted_proposal_id: 65537,
            value: vec![],
        };
        assert_eq!(PaxosMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn garbage_rejected() {
        assert!(PaxosMessage::decode(b"").is_err());
        assert!(PaxosMessage::decode(b"z:1:2").is_err());
        assert!(PaxosMessage::decode(b"1:1").is_err());
    }
}
