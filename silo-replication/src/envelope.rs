//! Outbound message collection.
//!
//! Protocol components never talk to the network directly; they push
//! envelopes into an [`Outbox`] and the driver flushes them through the
//! cluster transport. This keeps the state machines synchronous and lets
//! tests run whole quorums on an in-memory bus.

use anyhow::{bail, Error};

use silo_api_types::NodeId;

use crate::lease::message::LeaseMessage;
use crate::paxos::message::PaxosMessage;

/// Framing tag for paxos payloads inside a quorum frame.
pub const PROTOCOL_PAXOS: u8 = b'P';
/// Framing tag for lease payloads inside a quorum frame.
pub const PROTOCOL_LEASE: u8 = b'L';

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    Paxos(PaxosMessage),
    Lease(LeaseMessage),
}

impl PeerMessage {
    pub fn encode(&self) -> Vec<u8> {
        let (tag, mut payload) = match self {
            PeerMessage::Paxos(msg) => (PROTOCOL_PAXOS, msg.encode()),
            PeerMessage::Lease(msg) => (PROTOCOL_LEASE, msg.encode()),
        };
        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.push(tag);
        bytes.append(&mut payload);
        bytes
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        match data.first() {
            Some(&PROTOCOL_PAXOS) => Ok(PeerMessage::Paxos(PaxosMessage::decode(&data[1..])?)),
            Some(&PROTOCOL_LEASE) => Ok(PeerMessage::Lease(LeaseMessage::decode(&data[1..])?)),
            Some(tag) => bail!("unknown replication protocol tag {:#x}", tag),
            None => bail!("empty replication message"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendTo {
    Node(NodeId),
    /// All other quorum members.
    Others,
}

#[derive(Clone, Debug)]
pub struct Envelope {
    pub to: SendTo,
    pub message: PeerMessage,
}

#[derive(Default)]
pub struct Outbox {
    envelopes: Vec<Envelope>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_to(&mut self, node_id: NodeId, message: PeerMessage) {
        self.envelopes.push(Envelope {
            to: SendTo::Node(node_id),
            message,
        });
    }

    pub fn broadcast(&mut self, message: PeerMessage) {
        self.envelopes.push(Envelope {
            to: SendTo::Others,
            message,
        });
    }

    pub fn drain(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.envelopes)
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_message_tagging() {
        let msg = PeerMessage::Paxos(PaxosMessage::RequestChosen {
            node_id: 1,
            paxos_id: 2,
        });
        let bytes = msg.encode();
        assert_eq!(bytes[0], PROTOCOL_PAXOS);
        assert_eq!(PeerMessage::decode(&bytes).unwrap(), msg);

        let msg = PeerMessage::Lease(LeaseMessage::PrepareRejected {
            node_id: 1,
            proposal_id: 3,
        });
        let bytes = msg.encode();
        assert_eq!(bytes[0], PROTOCOL_LEASE);
        assert_eq!(PeerMessage::decode(&bytes).unwrap(), msg);

        assert!(PeerMessage::decode(b"X123").is_err());
        assert!(PeerMessage::decode(b"").is_err());
    }
}
