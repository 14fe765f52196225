//! The shard quorum context: replicated log + lease + storage for one
//! shard group.
//!
//! Client-facing requests are queued as shard op batches; while this node is
//! the leader they are packaged into replicated values and appended. Every
//! replica applies chosen values to its storage environment in `paxosID`
//! order and commits the log track afterwards. Losing the lease fails all
//! queued requests with a no-service error and drops any in-flight
//! proposal.

use anyhow::{format_err, Error};

use silo_api_types::{NodeId, QuorumId, ShardError, TrackId};
use silo_replication::envelope::{Outbox, PeerMessage, SendTo};
use silo_replication::{
    LeaseEvent, LogState, PaxosLease, Quorum, QuorumContext, ReplicatedLog, ReplicationStore,
};
use silo_storage::{GetResult, StorageEnvironment, WriteResult};

use super::message::{self, ShardOp};

pub type RequestCallback = Box<dyn FnOnce(Result<(), ShardError>)>;

struct PendingRequest {
    ops: Vec<ShardOp>,
    done: Option<RequestCallback>,
}

/// Storage-side half of the quorum context; receives the replicated-log
/// callbacks.
pub struct ShardState {
    env: StorageEnvironment,
    track_id: TrackId,
    /// Requests not yet proposed.
    pending: Vec<PendingRequest>,
    /// Requests inside the value currently being replicated.
    in_flight: Vec<PendingRequest>,
    last_applied_paxos_id: u64,
    catchup_needed: bool,
    apply_error: Option<String>,
}

impl ShardState {
    fn apply_ops(&mut self, value: &[u8]) -> Result<(), Error> {
        let ops = message::decode_ops(value)?;
        for op in &ops {
            self.apply_op(op)?;
        }
        // replicated writes are flushed right away; completion is logged
        // only, client completions do not wait for the fsync of followers
        self.env.commit(
            self.track_id,
            Box::new(|result| {
                if let Err(err) = result {
                    log::error!("log commit after append failed - {}", err);
                }
            }),
        );
        Ok(())
    }

    fn apply_op(&mut self, op: &ShardOp) -> Result<(), Error> {
        match op {
            ShardOp::Set {
                context_id,
                shard_id,
                key,
                value,
            } => match self.env.set(*context_id, *shard_id, key, value)? {
                WriteResult::Done(_) => Ok(()),
                other => {
                    log::warn!("replicated set not applied: {:?}", other);
                    Ok(())
                }
            },
            ShardOp::Delete {
                context_id,
                shard_id,
                key,
            } => match self.env.delete(*context_id, *shard_id, key)? {
                WriteResult::Done(_) => Ok(()),
                other => {
                    log::warn!("replicated delete not applied: {:?}", other);
                    Ok(())
                }
            },
            // chosen values may be re-applied after a restart; shard
            // management ops must tolerate the replay
            ShardOp::CreateShard { .. } => {
                let spec = op.create_shard_spec().unwrap();
                if let Err(err) = self.env.create_shard(spec) {
                    log::warn!("replicated create shard not applied: {}", err);
                }
                Ok(())
            }
            ShardOp::DeleteShard {
                context_id,
                shard_id,
            } => {
                if let Err(err) = self.env.delete_shard(*context_id, *shard_id) {
                    log::warn!("replicated delete shard not applied: {}", err);
                }
                Ok(())
            }
            ShardOp::SplitShard {
                context_id,
                shard_id,
                new_shard_id,
                split_key,
            } => {
                if let Err(err) =
                    self.env
                        .split_shard(*context_id, *shard_id, *new_shard_id, split_key)
                {
                    log::warn!("replicated split shard not applied: {}", err);
                }
                Ok(())
            }
        }
    }

    fn fail_all(&mut self, error: ShardError) {
        for request in self.in_flight.drain(..).chain(self.pending.drain(..)) {
            if let Some(done) = request.done {
                done(Err(error.clone()));
            }
        }
    }
}

impl QuorumContext for ShardState {
    fn on_append(&mut self, paxos_id: u64, value: &[u8], own_append: bool) {
        debug_assert!(paxos_id > self.last_applied_paxos_id);
        self.last_applied_paxos_id = paxos_id;

        if !message::is_dummy(value) {
            if let Err(err) = self.apply_ops(value) {
                // a replica that cannot apply chosen values is broken
                log::error!("unable to apply replicated value {} - {}", paxos_id, err);
                self.apply_error = Some(err.to_string());
                return;
            }
        }

        if own_append {
            for request in self.in_flight.drain(..) {
                if let Some(done) = request.done {
                    done(Ok(()));
                }
            }
        }
    }

    fn on_learn_lease(&mut self) {}

    fn on_lease_timeout(&mut self) {
        self.fail_all(ShardError::NoService);
    }

    fn on_start_catchup(&mut self) {
        self.catchup_needed = true;
    }
}

pub struct ShardQuorum {
    quorum_id: QuorumId,
    quorum: Quorum,
    log: ReplicatedLog,
    lease: PaxosLease,
    store: Box<dyn ReplicationStore>,
    state: ShardState,
    outbox: Outbox,
}

impl ShardQuorum {
    pub fn new(
        quorum_id: QuorumId,
        quorum: Quorum,
        track_id: TrackId,
        lease_duration_ms: u64,
        mut store: Box<dyn ReplicationStore>,
        env: StorageEnvironment,
        now: u64,
    ) -> Result<Self, Error> {
        let restart_counter = store.bump_restart_counter()?;
        let log = ReplicatedLog::new(quorum.clone(), restart_counter, store.as_mut())?;
        let lease = PaxosLease::new(quorum.clone(), restart_counter, lease_duration_ms, now);

        Ok(Self {
            quorum_id,
            quorum,
            log,
            lease,
            store,
            state: ShardState {
                env,
                track_id,
                pending: Vec::new(),
                in_flight: Vec::new(),
                last_applied_paxos_id: 0,
                catchup_needed: false,
                apply_error: None,
            },
            outbox: Outbox::new(),
        })
    }

    pub fn quorum_id(&self) -> QuorumId {
        self.quorum_id
    }

    pub fn node_id(&self) -> NodeId {
        self.quorum.node_id()
    }

    pub fn storage(&mut self) -> &mut StorageEnvironment {
        &mut self.state.env
    }

    pub fn paxos_id(&self) -> u64 {
        self.log.paxos_id()
    }

    /// Lease held and the multi-paxos fast path armed.
    pub fn is_leader(&mut self, now: u64) -> bool {
        self.lease.is_lease_owner(now) && self.log.multi_paxos()
    }

    pub fn lease_owner(&mut self, now: u64) -> Option<NodeId> {
        self.lease.lease_owner(now)
    }

    /// A bulk catchup was requested by the log and awaits the control plane.
    pub fn catchup_needed(&self) -> bool {
        self.state.catchup_needed
    }

    pub fn complete_catchup(&mut self, paxos_id: u64) -> Result<(), Error> {
        self.state.catchup_needed = false;
        self.log.on_catchup_complete(paxos_id, self.store.as_mut())
    }

    /// A fatal error while applying replicated state, if any.
    pub fn failure(&self) -> Option<String> {
        self.state
            .apply_error
            .clone()
            .or_else(|| self.state.env.fatal_error().map(|s| s.to_string()))
    }

    /// Queue a client request. `done` fires once the batch is chosen and
    /// applied locally, or fails with a client-visible error.
    pub fn request(&mut self, ops: Vec<ShardOp>, done: Option<RequestCallback>, now: u64) {
        if !self.is_leader(now) {
            if let Some(done) = done {
                done(Err(ShardError::NoService));
            }
            return;
        }
        self.state.pending.push(PendingRequest { ops, done });
        self.try_append(now);
    }

    /// Leader-local read.
    pub fn get(
        &mut self,
        context_id: silo_api_types::ContextId,
        shard_id: silo_api_types::ShardId,
        key: &[u8],
        now: u64,
    ) -> Result<Vec<u8>, ShardError> {
        if !self.is_leader(now) {
            return Err(ShardError::NoService);
        }
        match self.state.env.get(context_id, shard_id, key) {
            Ok(GetResult::Value(value)) => Ok(value),
            Ok(GetResult::NotFound) => Err(ShardError::NotFound),
            Ok(GetResult::WrongShard) => Err(ShardError::WrongShard),
            Ok(GetResult::NoShard) => Err(ShardError::Failed("no such shard".into())),
            Err(err) => Err(ShardError::Failed(err.to_string())),
        }
    }

    /// Append a no-op to advance the log when there is nothing to propose.
    pub fn append_dummy(&mut self, now: u64) {
        if self.is_leader(now)
            && self.log.state() == LogState::Idle
            && self.state.pending.is_empty()
            && !self.log.is_appending()
        {
            if let Err(err) = self
                .log
                .append(message::DUMMY_VALUE.to_vec(), &mut self.outbox, now)
            {
                log::debug!("dummy append refused - {}", err);
            }
        }
    }

    fn try_append(&mut self, now: u64) {
        if self.log.state() != LogState::Idle || self.log.is_appending() {
            return;
        }
        if self.state.pending.is_empty() || !self.is_leader(now) {
            return;
        }

        // batch pending requests into one value, bounded by the paxos limit
        let mut ops = Vec::new();
        let mut batch = Vec::new();
        let mut size = 0usize;
        while let Some(request) = self.state.pending.first() {
            let encoded = message::encode_ops(&request.ops).len() + 1;
            if !batch.is_empty() && size + encoded > silo_api_types::MAX_REPLICATION_SIZE {
                break;
            }
            size += encoded;
            let mut request = self.state.pending.remove(0);
            ops.append(&mut request.ops);
            batch.push(request);
        }

        let value = message::encode_ops(&ops);
        match self.log.append(value, &mut self.outbox, now) {
            Ok(()) => self.state.in_flight = batch,
            Err(err) => {
                log::warn!("append failed - {}", err);
                for request in batch {
                    if let Some(done) = request.done {
                        done(Err(ShardError::NoService));
                    }
                }
            }
        }
    }

    /// Handle one incoming peer message.
    pub fn on_peer_message(&mut self, message: PeerMessage, now: u64) -> Result<(), Error> {
        match message {
            PeerMessage::Paxos(msg) => {
                self.log.on_message(
                    &msg,
                    self.store.as_mut(),
                    &mut self.state,
                    &mut self.outbox,
                    now,
                )?;
            }
            PeerMessage::Lease(msg) => {
                let events = self.lease.on_message(&msg, &mut self.outbox, now);
                self.handle_lease_events(events, now);
            }
        }
        self.try_append(now);
        Ok(())
    }

    /// Drive timers. Call at startup and whenever `next_timeout` fires.
    pub fn tick(&mut self, now: u64) -> Result<(), Error> {
        let events = self.lease.tick(self.log.paxos_id(), &mut self.outbox, now);
        self.handle_lease_events(events, now);
        self.log.on_timeout(&mut self.outbox, now)?;
        self.state.env.poll_completions()?;
        self.try_append(now);
        Ok(())
    }

    pub fn next_timeout(&self) -> Option<u64> {
        match (self.lease.next_timeout(), self.log.next_timeout()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_lease_events(&mut self, events: Vec<LeaseEvent>, now: u64) {
        for event in events {
            match event {
                LeaseEvent::LearnLease => {
                    let own = self.lease.is_lease_owner(now);
                    if own {
                        log::info!("node {} acquired the lease", self.node_id());
                    }
                    self.log.set_multi_paxos(own);
                    self.state.on_learn_lease();
                }
                LeaseEvent::LeaseTimeout => {
                    log::info!("lease expired on node {}", self.node_id());
                    self.log.set_multi_paxos(false);
                    self.log.stop_appending();
                    self.state.on_lease_timeout();
                }
            }
        }
    }

    /// Flush the outbox: deliver self-addressed messages locally (the local
    /// acceptor votes like any other) and return the frames to put on the
    /// wire, already encoded per destination node.
    pub fn pump(&mut self, now: u64) -> Result<Vec<(NodeId, Vec<u8>)>, Error> {
        let mut outgoing = Vec::new();
        loop {
            let envelopes = self.outbox.drain();
            if envelopes.is_empty() {
                break;
            }
            for envelope in envelopes {
                match envelope.to {
                    SendTo::Node(node_id) if node_id == self.node_id() => {
                        self.on_peer_message(envelope.message, now)?;
                    }
                    SendTo::Node(node_id) => {
                        outgoing.push((node_id, envelope.message.encode()));
                    }
                    SendTo::Others => {
                        let encoded = envelope.message.encode();
                        for peer in self.quorum.other_nodes() {
                            outgoing.push((peer, encoded.clone()));
                        }
                        self.on_peer_message(envelope.message, now)?;
                    }
                }
            }
        }
        Ok(outgoing)
    }

    /// Decode and process a frame received from the cluster transport.
    pub fn on_wire_message(&mut self, payload: &[u8], now: u64) -> Result<(), Error> {
        let message = PeerMessage::decode(payload)
            .map_err(|err| format_err!("malformed quorum message - {}", err))?;
        self.on_peer_message(message, now)
    }
}
