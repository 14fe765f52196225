//! Node-to-node cluster transport.
//!
//! Length-delimited frames over TCP. The first payload byte selects the
//! protocol: `'C'` for cluster control, `'Q'` for quorum messages, which are
//! additionally prefixed with the quorum id so delivery can dispatch to the
//! registered quorum context. Outbound connections reconnect with
//! exponential backoff and jitter; messages sent while unconnected are
//! dropped (paxos retries cover the loss).

use std::collections::HashMap;

use anyhow::{bail, Error};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use silo_api_types::{NodeId, QuorumId};

pub const PROTOCOL_CLUSTER: u8 = b'C';
pub const PROTOCOL_QUORUM: u8 = b'Q';

const RECONNECT_BASE_MS: u64 = 100;
const RECONNECT_MAX_MS: u64 = 5000;
const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IncomingMessage {
    Cluster {
        from: NodeId,
        payload: Vec<u8>,
    },
    Quorum {
        from: NodeId,
        quorum_id: QuorumId,
        payload: Vec<u8>,
    },
}

pub fn encode_cluster_frame(from: NodeId, payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(payload.len() + 24);
    frame.push(PROTOCOL_CLUSTER);
    frame.extend_from_slice(from.to_string().as_bytes());
    frame.push(b':');
    frame.extend_from_slice(payload);
    Bytes::from(frame)
}

pub fn encode_quorum_frame(from: NodeId, quorum_id: QuorumId, payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(payload.len() + 44);
    frame.push(PROTOCOL_QUORUM);
    frame.extend_from_slice(quorum_id.to_string().as_bytes());
    frame.push(b':');
    frame.extend_from_slice(from.to_string().as_bytes());
    frame.push(b':');
    frame.extend_from_slice(payload);
    Bytes::from(frame)
}

fn split_u64(data: &[u8]) -> Result<(u64, &[u8]), Error> {
    let sep = data
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| anyhow::format_err!("frame field not terminated"))?;
    let digits = std::str::from_utf8(&data[..sep])?;
    Ok((digits.parse()?, &data[sep + 1..]))
}

pub fn decode_frame(data: &[u8]) -> Result<IncomingMessage, Error> {
    match data.first() {
        Some(&PROTOCOL_CLUSTER) => {
            let (from, payload) = split_u64(&data[1..])?;
            Ok(IncomingMessage::Cluster {
                from,
                payload: payload.to_vec(),
            })
        }
        Some(&PROTOCOL_QUORUM) => {
            let (quorum_id, rest) = split_u64(&data[1..])?;
            let (from, payload) = split_u64(rest)?;
            Ok(IncomingMessage::Quorum {
                from,
                quorum_id,
                payload: payload.to_vec(),
            })
        }
        Some(tag) => bail!("unknown cluster frame tag {:#x}", tag),
        None => bail!("empty cluster frame"),
    }
}

#[derive(Clone, Debug)]
pub struct PeerAddress {
    pub node_id: NodeId,
    pub address: String,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub node_id: NodeId,
    pub listen_address: String,
    pub peers: Vec<PeerAddress>,
}

pub struct ClusterTransport {
    node_id: NodeId,
    outbound: HashMap<NodeId, mpsc::UnboundedSender<Bytes>>,
    incoming: mpsc::UnboundedReceiver<IncomingMessage>,
}

impl ClusterTransport {
    pub async fn start(config: TransportConfig) -> Result<Self, Error> {
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        let listener = TcpListener::bind(&config.listen_address).await?;
        log::info!("cluster transport listening on {}", config.listen_address);
        tokio::spawn(accept_loop(listener, incoming_tx.clone()));

        let mut outbound = HashMap::new();
        for peer in &config.peers {
            if peer.node_id == config.node_id {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            outbound.insert(peer.node_id, tx);
            tokio::spawn(connect_loop(peer.clone(), rx));
        }

        Ok(Self {
            node_id: config.node_id,
            outbound,
            incoming,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Send a quorum-tagged message; silently dropped when unconnected.
    pub fn send_quorum(&self, to: NodeId, quorum_id: QuorumId, payload: &[u8]) {
        let frame = encode_quorum_frame(self.node_id, quorum_id, payload);
        self.send_frame(to, frame);
    }

    pub fn send_cluster(&self, to: NodeId, payload: &[u8]) {
        let frame = encode_cluster_frame(self.node_id, payload);
        self.send_frame(to, frame);
    }

    fn send_frame(&self, to: NodeId, frame: Bytes) {
        match self.outbound.get(&to) {
            Some(tx) => {
                // a full/closed channel counts as a drop
                let _ = tx.send(frame);
            }
            None => log::debug!("no route to node {}, dropping frame", to),
        }
    }

    pub async fn recv(&mut self) -> Option<IncomingMessage> {
        self.incoming.recv().await
    }
}

fn new_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

async fn accept_loop(
    listener: TcpListener,
    incoming_tx: mpsc::UnboundedSender<IncomingMessage>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                log::debug!("accepted cluster connection from {}", peer_addr);
                tokio::spawn(read_loop(stream, incoming_tx.clone()));
            }
            Err(err) => {
                log::warn!("accept failed - {}", err);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_loop(stream: TcpStream, incoming_tx: mpsc::UnboundedSender<IncomingMessage>) {
    let mut frames = FramedRead::new(stream, new_codec());
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                log::debug!("cluster connection read error - {}", err);
                return;
            }
        };
        match decode_frame(&frame) {
            Ok(message) => {
                if incoming_tx.send(message).is_err() {
                    return; // transport dropped
                }
            }
            Err(err) => {
                log::warn!("dropping malformed cluster frame - {}", err);
            }
        }
    }
}

async fn connect_loop(peer: PeerAddress, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    let mut backoff_ms = RECONNECT_BASE_MS;
    loop {
        match TcpStream::connect(&peer.address).await {
            Ok(stream) => {
                log::debug!("connected to node {} at {}", peer.node_id, peer.address);
                backoff_ms = RECONNECT_BASE_MS;
                let mut sink = FramedWrite::new(stream, new_codec());
                loop {
                    match rx.recv().await {
                        Some(frame) => {
                            if let Err(err) = sink.send(frame).await {
                                log::debug!(
                                    "connection to node {} lost - {}",
                                    peer.node_id,
                                    err
                                );
                                break;
                            }
                        }
                        None => return, // transport dropped
                    }
                }
            }
            Err(err) => {
                log::debug!(
                    "unable to connect to node {} at {} - {}",
                    peer.node_id,
                    peer.address,
                    err
                );
                // outbound messages are dropped while unconnected
                while rx.try_recv().is_ok() {}
            }
        }

        let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 2);
        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms + jitter)).await;
        backoff_ms = (backoff_ms * 2).min(RECONNECT_MAX_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = encode_quorum_frame(3, 77, b"P1:2:3");
        match decode_frame(&frame).unwrap() {
            IncomingMessage::Quorum {
                from,
                quorum_id,
                payload,
            } => {
                assert_eq!(from, 3);
                assert_eq!(quorum_id, 77);
                assert_eq!(payload, b"P1:2:3");
            }
            other => panic!("unexpected message {:?}", other),
        }

        let frame = encode_cluster_frame(9, b"hello");
        assert_eq!(
            decode_frame(&frame).unwrap(),
            IncomingMessage::Cluster {
                from: 9,
                payload: b"hello".to_vec()
            }
        );

        assert!(decode_frame(b"").is_err());
        assert!(decode_frame(b"X1:2").is_err());
        assert!(decode_frame(b"Q12").is_err());
    }

    #[tokio::test]
    async fn messages_flow_between_transports() {
        let config_a = TransportConfig {
            node_id: 1,
            listen_address: "127.0.0.1:39401".to_string(),
            peers: vec![PeerAddress {
                node_id: 2,
                address: "127.0.0.1:39402".to_string(),
            }],
        };
        let config_b = TransportConfig {
            node_id: 2,
            listen_address: "127.0.0.1:39402".to_string(),
            peers: vec![PeerAddress {
                node_id: 1,
                address: "127.0.0.1:39401".to_string(),
            }],
        };

        let transport_a = ClusterTransport::start(config_a).await.unwrap();
        let mut transport_b = ClusterTransport::start(config_b).await.unwrap();

        // sends may be dropped until the connection is up; retry
        let received = loop {
            transport_a.send_quorum(2, 5, b"Lping");
            match tokio::time::timeout(
                std::time::Duration::from_millis(200),
                transport_b.recv(),
            )
            .await
            {
                Ok(Some(message)) => break message,
                _ => continue,
            }
        };

        assert_eq!(
            received,
            IncomingMessage::Quorum {
                from: 1,
                quorum_id: 5,
                payload: b"Lping".to_vec()
            }
        );
    }
}
