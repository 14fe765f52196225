//! Paxos acceptor role.
//!
//! The acceptor's promise/accept state is persisted through the replication
//! store before any reply is handed to the outbox; a crash between persist
//! and send only loses a reply, never a promise.

use anyhow::Error;

use silo_api_types::NodeId;

use crate::store::{AcceptorState, ReplicationStore};

use super::message::PaxosMessage;

pub struct PaxosAcceptor {
    node_id: NodeId,
    state: AcceptorState,
}

impl PaxosAcceptor {
    pub fn new(node_id: NodeId, restored: Option<AcceptorState>) -> Self {
        Self {
            node_id,
            state: restored.unwrap_or_default(),
        }
    }

    pub fn state(&self) -> &AcceptorState {
        &self.state
    }

    /// Forget promise/accept state when the log moves to a new instance.
    pub fn reset_for_instance(
        &mut self,
        paxos_id: u64,
        store: &mut dyn ReplicationStore,
    ) -> Result<(), Error> {
        self.state = AcceptorState {
            paxos_id,
            ..Default::default()
        };
        store.save_acceptor_state(&self.state)
    }

    pub fn on_prepare_request(
        &mut self,
        paxos_id: u64,
        proposal_id: u64,
        store: &mut dyn ReplicationStore,
    ) -> Result<PaxosMessage, Error> {
        if proposal_id < self.state.promised_proposal_id {
            return Ok(PaxosMessage::PrepareRejected {
                node_id: self.node_id,
                paxos_id,
                proposal_id,
                promised_proposal_id: self.state.promised_proposal_id,
            });
        }

        self.state.paxos_id = paxos_id;
        self.state.promised_proposal_id = proposal_id;
        store.save_acceptor_state(&self.state)?;

        Ok(match (&self.state.accepted_proposal_id, &self.state.accepted_value) {
            (Some(accepted_proposal_id), Some(value)) => {
                PaxosMessage::PreparePreviouslyAccepted {
                    node_id: self.node_id,
                    paxos_id,
                    proposal_id,
                    accepted_proposal_id: *accepted_proposal_id,
                    value: value.clone(),
                }
            }
            _ => PaxosMessage::PrepareCurrentlyOpen {
                node_id: self.node_id,
                paxos_id,
                proposal_id,
            },
        })
    }

    pub fn on_propose_request(
        &mut self,
        paxos_id: u64,
        proposal_id: u64,
        value: Vec<u8>,
        store: &mut dyn ReplicationStore,
    ) -> Result<PaxosMessage, Error> {
        if proposal_id < self.state.promised_proposal_id {
            return Ok(PaxosMessage::ProposeRejected {
                node_id: self.node_id,
                paxos_id,
                proposal_id,
                promised_proposal_id: self.state.promised_proposal_id,
            });
        }

        self.state.paxos_id = paxos_id;
        self.state.promised_proposal_id = proposal_id;
        self.state.accepted_proposal_id = Some(proposal_id);
        self.state.accepted_value = Some(value);
        store.save_acceptor_state(&self.state)?;

        Ok(PaxosMessage::ProposeAccepted {
            node_id: self.node_id,
            paxos_id,
            proposal_id,
        })
    }
}
