//! The replicated log: sequencing values through paxos instances.
//!
//! One value is chosen per `paxosID`; chosen values are delivered to the
//! quorum context in strict `paxosID` order. While the local node holds the
//! lease, phase 1 is skipped and appends go straight to the propose round
//! ("multi paxos"). A node that discovers it is far behind suspends
//! proposals and asks the context to run a bulk catchup; small gaps are
//! closed instance-by-instance with `RequestChosen`.

use anyhow::{bail, Error};

use silo_api_types::{NodeId, MAX_REPLICATION_SIZE};

use crate::context::QuorumContext;
use crate::envelope::{Outbox, PeerMessage};
use crate::paxos::{PaxosAcceptor, PaxosLearner, PaxosMessage, PaxosProposer, ProposerEvent};
use crate::quorum::Quorum;
use crate::store::ReplicationStore;

pub const DEFAULT_PAXOS_TIMEOUT_MS: u64 = 3000;

/// Instance gap beyond which we give up on per-instance recovery and ask the
/// context for a bulk catchup.
pub const CATCHUP_THRESHOLD: u64 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogState {
    Idle,
    Proposing,
    /// Own acceptor has durably stored this node's PROPOSE; the round now
    /// only waits on the rest of the quorum.
    Waiting,
    CatchingUp,
}

pub struct ReplicatedLog {
    quorum: Quorum,
    paxos_id: u64,
    state: LogState,
    multi_paxos_enabled: bool,
    proposer: PaxosProposer,
    acceptor: PaxosAcceptor,
    learner: PaxosLearner,
    /// Value this node is trying to get chosen, if any.
    own_pending: Option<Vec<u8>>,
    /// Highest instance known decided somewhere in the quorum, and a node
    /// that can serve its value; drives `RequestChosen` chains.
    highest_seen_decided: u64,
    catchup_source: NodeId,
}

impl ReplicatedLog {
    pub fn new(
        quorum: Quorum,
        restart_counter: u64,
        store: &mut dyn ReplicationStore,
    ) -> Result<Self, Error> {
        let node_id = quorum.node_id();
        let restored = store.load_acceptor_state()?;
        let paxos_id = restored.as_ref().map(|s| s.paxos_id).unwrap_or(1).max(1);

        Ok(Self {
            proposer: PaxosProposer::new(node_id, restart_counter, DEFAULT_PAXOS_TIMEOUT_MS),
            acceptor: PaxosAcceptor::new(node_id, restored),
            learner: PaxosLearner::new(node_id),
            quorum,
            paxos_id,
            state: LogState::Idle,
            multi_paxos_enabled: false,
            own_pending: None,
            highest_seen_decided: 0,
            catchup_source: 0,
        })
    }

    pub fn paxos_id(&self) -> u64 {
        self.paxos_id
    }

    pub fn state(&self) -> LogState {
        self.state
    }

    pub fn is_appending(&self) -> bool {
        self.own_pending.is_some()
    }

    pub fn last_learn_time(&self) -> u64 {
        self.learner.last_learn_time()
    }

    /// Toggle the lease-held fast path.
    pub fn set_multi_paxos(&mut self, enabled: bool) {
        self.multi_paxos_enabled = enabled;
    }

    pub fn multi_paxos(&self) -> bool {
        self.multi_paxos_enabled
    }

    /// Drop any in-flight proposal (lease lost).
    pub fn stop_appending(&mut self) {
        self.own_pending = None;
        self.proposer.stop();
        if matches!(self.state, LogState::Proposing | LogState::Waiting) {
            self.state = LogState::Idle;
        }
    }

    /// Start replicating `value`. Only valid while idle.
    pub fn append(&mut self, value: Vec<u8>, out: &mut Outbox, now: u64) -> Result<(), Error> {
        if self.state != LogState::Idle {
            bail!("replicated log is not idle");
        }
        if self.own_pending.is_some() {
            bail!("append already in progress");
        }
        if value.len() > MAX_REPLICATION_SIZE {
            bail!("replicated value too large ({} bytes)", value.len());
        }

        self.own_pending = Some(value.clone());
        self.state = LogState::Proposing;
        if self.multi_paxos_enabled {
            self.proposer.start_propose(self.paxos_id, value, out, now);
        } else {
            self.proposer.start_prepare(self.paxos_id, value, out, now);
        }
        Ok(())
    }

    pub fn next_timeout(&self) -> Option<u64> {
        self.proposer.next_timeout()
    }

    pub fn on_timeout(
        &mut self,
        out: &mut Outbox,
        now: u64,
    ) -> Result<(), Error> {
        if !matches!(self.state, LogState::Proposing | LogState::Waiting) {
            return Ok(());
        }
        if self.proposer.on_timeout(now) {
            // fast path failed or round lost: fall back to a full round
            let value = self
                .own_pending
                .clone()
                .unwrap_or_else(|| self.proposer.value().to_vec());
            self.state = LogState::Proposing;
            self.proposer.start_prepare(self.paxos_id, value, out, now);
        }
        Ok(())
    }

    pub fn on_message(
        &mut self,
        msg: &PaxosMessage,
        store: &mut dyn ReplicationStore,
        ctx: &mut dyn QuorumContext,
        out: &mut Outbox,
        now: u64,
    ) -> Result<(), Error> {
        let from = msg.node_id();
        if !self.quorum.contains(from) {
            log::debug!("ignoring paxos message from non-member {}", from);
            return Ok(());
        }

        match msg {
            PaxosMessage::PrepareRequest {
                paxos_id,
                proposal_id,
                ..
            } => {
                if self.check_behind(*paxos_id, paxos_id.saturating_sub(1), from, ctx, out, now) {
                    return Ok(());
                }
                if *paxos_id < self.paxos_id {
                    self.help_lagging_node(from, *paxos_id, store, out)?;
                    return Ok(());
                }
                let reply = self
                    .acceptor
                    .on_prepare_request(*paxos_id, *proposal_id, store)?;
                out.send_to(from, PeerMessage::Paxos(reply));
            }
            PaxosMessage::ProposeRequest {
                paxos_id,
                proposal_id,
                value,
                ..
            } => {
                if self.check_behind(*paxos_id, paxos_id.saturating_sub(1), from, ctx, out, now) {
                    return Ok(());
                }
                if *paxos_id < self.paxos_id {
                    self.help_lagging_node(from, *paxos_id, store, out)?;
                    return Ok(());
                }
                let reply = self.acceptor.on_propose_request(
                    *paxos_id,
                    *proposal_id,
                    value.clone(),
                    store,
                )?;
                // own PROPOSE durably stored: the round now waits on the
                // rest of the quorum
                if from == self.quorum.node_id()
                    && self.state == LogState::Proposing
                    && matches!(reply, PaxosMessage::ProposeAccepted { .. })
                {
                    self.state = LogState::Waiting;
                }
                out.send_to(from, PeerMessage::Paxos(reply));
            }
            PaxosMessage::LearnChosen {
                paxos_id, value, ..
            } => {
                if *paxos_id == self.paxos_id {
                    self.process_chosen(value.clone(), store, ctx, out, now)?;
                } else if *paxos_id > self.paxos_id {
                    self.check_behind(*paxos_id, *paxos_id, from, ctx, out, now);
                }
            }
            PaxosMessage::RequestChosen { paxos_id, .. } => {
                if *paxos_id < self.paxos_id {
                    self.help_lagging_node(from, *paxos_id, store, out)?;
                }
            }
            response => {
                if !matches!(self.state, LogState::Proposing | LogState::Waiting)
                    || response.paxos_id() != self.paxos_id
                {
                    return Ok(());
                }
                let event =
                    self.proposer
                        .on_message(self.paxos_id, response, &self.quorum, out, now);
                if let ProposerEvent::Chosen(value) = event {
                    out.broadcast(PeerMessage::Paxos(PaxosMessage::LearnChosen {
                        node_id: self.quorum.node_id(),
                        paxos_id: self.paxos_id,
                        value: value.clone(),
                    }));
                    self.process_chosen(value, store, ctx, out, now)?;
                }
            }
        }
        Ok(())
    }

    /// A message for a future instance means we missed decisions. Returns
    /// true when the caller should stop processing the message.
    fn check_behind(
        &mut self,
        msg_paxos_id: u64,
        decided_up_to: u64,
        from: NodeId,
        ctx: &mut dyn QuorumContext,
        out: &mut Outbox,
        now: u64,
    ) -> bool {
        if msg_paxos_id <= self.paxos_id {
            return false;
        }
        if decided_up_to > self.highest_seen_decided {
            self.highest_seen_decided = decided_up_to;
            self.catchup_source = from;
        }
        if self.state == LogState::CatchingUp {
            return true;
        }

        if msg_paxos_id - self.paxos_id > CATCHUP_THRESHOLD {
            log::info!(
                "replicated log is {} instances behind, starting catchup",
                msg_paxos_id - self.paxos_id
            );
            self.stop_appending();
            self.state = LogState::CatchingUp;
            ctx.on_start_catchup();
        } else {
            self.learner.request_chosen(from, self.paxos_id, out, now);
        }
        true
    }

    fn help_lagging_node(
        &mut self,
        from: NodeId,
        paxos_id: u64,
        store: &mut dyn ReplicationStore,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        if let Some(value) = store.load_chosen(paxos_id)? {
            out.send_to(
                from,
                PeerMessage::Paxos(PaxosMessage::LearnChosen {
                    node_id: self.quorum.node_id(),
                    paxos_id,
                    value,
                }),
            );
        }
        Ok(())
    }

    fn process_chosen(
        &mut self,
        value: Vec<u8>,
        store: &mut dyn ReplicationStore,
        ctx: &mut dyn QuorumContext,
        out: &mut Outbox,
        now: u64,
    ) -> Result<(), Error> {
        let own_append = self.own_pending.as_deref() == Some(value.as_slice());

        store.save_chosen(self.paxos_id, &value)?;
        ctx.on_append(self.paxos_id, &value, own_append);
        self.learner.note_learned(now);

        self.paxos_id += 1;
        self.acceptor.reset_for_instance(self.paxos_id, store)?;
        self.proposer.stop();
        self.state = LogState::Idle;

        if own_append {
            self.own_pending = None;
        } else if let Some(pending) = self.own_pending.clone() {
            // our value lost to an adopted one; drive it again for the next
            // instance with a full round
            self.state = LogState::Proposing;
            self.proposer.start_prepare(self.paxos_id, pending, out, now);
        }

        // keep pulling decided instances we know exist
        if self.state == LogState::Idle && self.paxos_id <= self.highest_seen_decided {
            let source = self.catchup_source;
            self.learner.request_chosen(source, self.paxos_id, out, now);
        }
        Ok(())
    }

    /// The context finished a bulk catchup up to (and excluding) `paxos_id`.
    pub fn on_catchup_complete(
        &mut self,
        paxos_id: u64,
        store: &mut dyn ReplicationStore,
    ) -> Result<(), Error> {
        // the log may have advanced past the snapshot point on its own
        if paxos_id > self.paxos_id {
            self.paxos_id = paxos_id;
        }
        self.acceptor.reset_for_instance(self.paxos_id, store)?;
        self.state = LogState::Idle;
        log::info!("catchup complete, resuming at instance {}", self.paxos_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::SendTo;
    use crate::store::MemoryReplicationStore;

    #[derive(Default)]
    struct TestContext {
        appends: Vec<(u64, Vec<u8>, bool)>,
        catchups: usize,
    }

    impl QuorumContext for TestContext {
        fn on_append(&mut self, paxos_id: u64, value: &[u8], own_append: bool) {
            self.appends.push((paxos_id, value.to_vec(), own_append));
        }
        fn on_learn_lease(&mut self) {}
        fn on_lease_timeout(&mut self) {}
        fn on_start_catchup(&mut self) {
            self.catchups += 1;
        }
    }

    struct Sim {
        logs: Vec<ReplicatedLog>,
        stores: Vec<MemoryReplicationStore>,
        ctxs: Vec<TestContext>,
        outs: Vec<Outbox>,
        /// Node indexes that drop all traffic (crashed).
        down: Vec<usize>,
        now: u64,
    }

    impl Sim {
        fn new(n: usize) -> Self {
            let nodes: Vec<u64> = (1..=n as u64).collect();
            let mut stores: Vec<MemoryReplicationStore> =
                (0..n).map(|_| MemoryReplicationStore::new()).collect();
            let logs = (0..n)
                .map(|i| {
                    ReplicatedLog::new(
                        Quorum::new(nodes[i], nodes.clone()),
                        1,
                        &mut stores[i],
                    )
                    .unwrap()
                })
                .collect();
            Self {
                logs,
                stores,
                ctxs: (0..n).map(|_| TestContext::default()).collect(),
                outs: (0..n).map(|_| Outbox::new()).collect(),
                down: Vec::new(),
                now: 1000,
            }
        }

        /// Deliver all outstanding messages (including self-broadcasts),
        /// advancing simulated time on quiet rounds.
        fn run(&mut self, rounds: usize) {
            for _ in 0..rounds {
                let mut delivered = false;
                for i in 0..self.logs.len() {
                    let envelopes = self.outs[i].drain();
                    for envelope in envelopes {
                        for j in 0..self.logs.len() {
                            if self.down.contains(&j) {
                                continue;
                            }
                            let deliver = match envelope.to {
                                SendTo::Node(id) => id == self.logs[j].quorum.node_id(),
                                SendTo::Others => true,
                            };
                            if !deliver {
                                continue;
                            }
                            if let PeerMessage::Paxos(msg) = &envelope.message {
                                delivered = true;
                                self.logs[j]
                                    .on_message(
                                        msg,
                                        &mut self.stores[j],
                                        &mut self.ctxs[j],
                                        &mut self.outs[j],
                                        self.now,
                                    )
                                    .unwrap();
                            }
                        }
                    }
                }
                if !delivered {
                    // quiet: fire the earliest pending timeout
                    let next = self
                        .logs
                        .iter()
                        .filter_map(|log| log.next_timeout())
                        .min();
                    match next {
                        Some(at) => {
                            self.now = self.now.max(at);
                            for i in 0..self.logs.len() {
                                if self.down.contains(&i) {
                                    continue;
                                }
                                self.logs[i].on_timeout(&mut self.outs[i], self.now).unwrap();
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    #[test]
    fn value_chosen_and_learned_by_all() {
        let mut sim = Sim::new(3);
        sim.logs[0]
            .append(b"hello".to_vec(), &mut sim.outs[0], sim.now)
            .unwrap();
        sim.run(100);

        for ctx in &sim.ctxs {
            assert_eq!(ctx.appends.len(), 1);
            assert_eq!(ctx.appends[0].0, 1);
            assert_eq!(ctx.appends[0].1, b"hello");
        }
        assert!(sim.ctxs[0].appends[0].2); // own append on the proposer
        assert!(!sim.ctxs[1].appends[0].2);
        for log in &sim.logs {
            assert_eq!(log.paxos_id(), 2);
            assert_eq!(log.state(), LogState::Idle);
        }
        assert!(!sim.logs[0].is_appending());
    }

    #[test]
    fn survives_minority_crash() {
        let mut sim = Sim::new(3);
        sim.down.push(2); // one of three acceptors down
        sim.logs[0]
            .append(b"resilient".to_vec(), &mut sim.outs[0], sim.now)
            .unwrap();
        sim.run(200);

        assert_eq!(sim.ctxs[0].appends.len(), 1);
        assert_eq!(sim.ctxs[1].appends.len(), 1);
        assert!(sim.ctxs[2].appends.is_empty());
    }

    #[test]
    fn at_most_one_value_per_instance_under_contention() {
        let mut sim = Sim::new(3);
        sim.logs[0]
            .append(b"from-node-1".to_vec(), &mut sim.outs[0], sim.now)
            .unwrap();
        sim.logs[1]
            .append(b"from-node-2".to_vec(), &mut sim.outs[1], sim.now)
            .unwrap();
        sim.run(2000);

        // agreement: every node saw the same value for every instance
        for paxos_id in 1..=2u64 {
            let mut seen: Option<Vec<u8>> = None;
            for ctx in &sim.ctxs {
                for (id, value, _) in &ctx.appends {
                    if *id == paxos_id {
                        match &seen {
                            None => seen = Some(value.clone()),
                            Some(prev) => assert_eq!(prev, value, "instance {} diverged", paxos_id),
                        }
                    }
                }
            }
        }

        // liveness: both values eventually chosen (in some order)
        let values: Vec<Vec<u8>> = sim.ctxs[0]
            .appends
            .iter()
            .map(|(_, value, _)| value.clone())
            .collect();
        assert!(values.contains(&b"from-node-1".to_vec()));
        assert!(values.contains(&b"from-node-2".to_vec()));
    }

    #[test]
    fn multi_paxos_skips_prepare() {
        let mut sim = Sim::new(3);
        sim.logs[0].set_multi_paxos(true);
        sim.logs[0]
            .append(b"fast".to_vec(), &mut sim.outs[0], sim.now)
            .unwrap();

        // the very first message out is the propose, not a prepare
        let envelopes = sim.outs[0].drain();
        assert_eq!(envelopes.len(), 1);
        match &envelopes[0].message {
            PeerMessage::Paxos(PaxosMessage::ProposeRequest { value, .. }) => {
                assert_eq!(value, b"fast")
            }
            other => panic!("unexpected first message {:?}", other),
        }
        // put it back for delivery
        for envelope in envelopes {
            sim.outs[0].broadcast(envelope.message);
        }
        sim.run(100);
        assert_eq!(sim.ctxs[1].appends.len(), 1);
    }

    #[test]
    fn own_stored_propose_moves_to_waiting() {
        let mut store = MemoryReplicationStore::new();
        let mut log = ReplicatedLog::new(Quorum::new(1, vec![1, 2, 3]), 1, &mut store).unwrap();
        let mut ctx = TestContext::default();
        let mut out = Outbox::new();

        log.set_multi_paxos(true);
        log.append(b"v".to_vec(), &mut out, 0).unwrap();
        assert_eq!(log.state(), LogState::Proposing);

        // self-delivery of the broadcast: the local acceptor stores the
        // propose, which ends the proposing phase
        let propose = match &out.drain()[0].message {
            PeerMessage::Paxos(msg) => msg.clone(),
            other => panic!("unexpected message {:?}", other),
        };
        log.on_message(&propose, &mut store, &mut ctx, &mut out, 0)
            .unwrap();
        assert_eq!(log.state(), LogState::Waiting);
        assert_eq!(store.num_acceptor_saves, 1);

        // the own accept alone is no majority; still waiting on the quorum
        let own_accept = match &out.drain()[0].message {
            PeerMessage::Paxos(msg) => msg.clone(),
            other => panic!("unexpected message {:?}", other),
        };
        log.on_message(&own_accept, &mut store, &mut ctx, &mut out, 0)
            .unwrap();
        assert_eq!(log.state(), LogState::Waiting);

        // one peer accept completes the majority
        let proposal_id = match &propose {
            PaxosMessage::ProposeRequest { proposal_id, .. } => *proposal_id,
            other => panic!("unexpected message {:?}", other),
        };
        let peer_accept = PaxosMessage::ProposeAccepted {
            node_id: 2,
            paxos_id: 1,
            proposal_id,
        };
        log.on_message(&peer_accept, &mut store, &mut ctx, &mut out, 0)
            .unwrap();
        assert_eq!(log.state(), LogState::Idle);
        assert_eq!(ctx.appends.len(), 1);
        assert!(ctx.appends[0].2);
    }

    #[test]
    fn small_gap_recovered_with_request_chosen() {
        let mut sim = Sim::new(3);
        // node 1 chooses instances 1 and 2 while node 3 is down
        sim.down.push(2);
        for value in [b"one".as_ref(), b"two".as_ref()] {
            sim.logs[0]
                .append(value.to_vec(), &mut sim.outs[0], sim.now)
                .unwrap();
            sim.run(200);
        }
        assert_eq!(sim.logs[0].paxos_id(), 3);
        assert_eq!(sim.logs[2].paxos_id(), 1);

        // node 3 comes back and sees traffic for instance 3
        sim.down.clear();
        sim.logs[0]
            .append(b"three".to_vec(), &mut sim.outs[0], sim.now)
            .unwrap();
        sim.run(500);

        let appended: Vec<u64> = sim.ctxs[2].appends.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(appended, vec![1, 2, 3]);
        assert_eq!(sim.logs[2].paxos_id(), 4);
    }

    #[test]
    fn large_gap_triggers_catchup() {
        let mut store = MemoryReplicationStore::new();
        let mut log = ReplicatedLog::new(Quorum::new(3, vec![1, 2, 3]), 1, &mut store).unwrap();
        let mut ctx = TestContext::default();
        let mut out = Outbox::new();

        let msg = PaxosMessage::LearnChosen {
            node_id: 1,
            paxos_id: 100,
            value: b"far-future".to_vec(),
        };
        log.on_message(&msg, &mut store, &mut ctx, &mut out, 0).unwrap();

        assert_eq!(log.state(), LogState::CatchingUp);
        assert_eq!(ctx.catchups, 1);
        // proposals are refused while catching up
        assert!(log.append(b"nope".to_vec(), &mut out, 0).is_err());

        log.on_catchup_complete(100, &mut store).unwrap();
        assert_eq!(log.state(), LogState::Idle);
        assert_eq!(log.paxos_id(), 100);
    }
}
