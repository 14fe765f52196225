//! End-to-end quorum scenarios on an in-memory message bus.
//!
//! Three shard quorums, each with its own storage environment, exchange
//! replication messages without sockets; simulated time is advanced only
//! when the bus is quiet. This covers leader election, replicated writes
//! reaching every replica's storage, leader failover and the no-service
//! behavior of non-leaders.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::PathBuf;
use std::rc::Rc;

use silo_api_types::{NodeId, ShardError, StorageType};
use silo_replication::{MemoryReplicationStore, Quorum};
use silo_storage::{GetResult, StorageConfig, StorageEnvironment};

use silodb::shard::{ShardOp, ShardQuorum};

const LEASE_MS: u64 = 2000;

struct Cluster {
    nodes: Vec<ShardQuorum>,
    node_ids: Vec<NodeId>,
    down: HashSet<NodeId>,
    now: u64,
    dirs: Vec<PathBuf>,
}

impl Cluster {
    fn new(test_name: &str, n: usize) -> Cluster {
        let node_ids: Vec<NodeId> = (1..=n as u64).collect();
        let mut nodes = Vec::new();
        let mut dirs = Vec::new();

        for node_id in &node_ids {
            let dir = std::env::temp_dir().join(format!(".silo-test-{}-{}", test_name, node_id));
            let _ = std::fs::remove_dir_all(&dir);
            let mut config = StorageConfig::new(&dir);
            config.num_job_threads = 1;
            let env = StorageEnvironment::open(config).unwrap();

            let quorum = Quorum::new(*node_id, node_ids.clone());
            let node = ShardQuorum::new(
                1,
                quorum,
                0,
                LEASE_MS,
                Box::new(MemoryReplicationStore::new()),
                env,
                0,
            )
            .unwrap();
            nodes.push(node);
            dirs.push(dir);
        }

        Cluster {
            nodes,
            node_ids,
            down: HashSet::new(),
            now: 0,
            dirs,
        }
    }

    fn node_index(&self, node_id: NodeId) -> usize {
        self.node_ids.iter().position(|id| *id == node_id).unwrap()
    }

    /// Pump outboxes and deliver frames until the bus is quiet, advancing
    /// simulated time on quiet rounds. Stops as soon as `pred` holds.
    fn run_until(&mut self, max_rounds: usize, mut pred: impl FnMut(&mut Cluster) -> bool) -> bool {
        for _ in 0..max_rounds {
            if pred(self) {
                return true;
            }

            let mut wire: Vec<(NodeId, Vec<u8>)> = Vec::new();
            for i in 0..self.nodes.len() {
                if self.down.contains(&self.node_ids[i]) {
                    continue;
                }
                wire.extend(self.nodes[i].pump(self.now).unwrap());
            }

            if wire.is_empty() {
                // quiet: move the clock to the earliest timer and tick
                let next = self
                    .nodes
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !self.down.contains(&self.node_ids[*i]))
                    .filter_map(|(_, node)| node.next_timeout())
                    .min();
                self.now = next.map_or(self.now + 100, |at| at.max(self.now + 1));
                for i in 0..self.nodes.len() {
                    if self.down.contains(&self.node_ids[i]) {
                        continue;
                    }
                    self.nodes[i].tick(self.now).unwrap();
                }
                continue;
            }

            for (to, payload) in wire {
                if self.down.contains(&to) {
                    continue;
                }
                let idx = self.node_index(to);
                self.nodes[idx].on_wire_message(&payload, self.now).unwrap();
            }
        }
        pred(self)
    }

    fn leader(&mut self) -> Option<NodeId> {
        let now = self.now;
        let down = self.down.clone();
        let mut leader = None;
        for node in self.nodes.iter_mut() {
            if down.contains(&node.node_id()) {
                continue;
            }
            if node.is_leader(now) {
                assert!(leader.is_none(), "two leaders at once");
                leader = Some(node.node_id());
            }
        }
        leader
    }

    fn leader_node(&mut self) -> &mut ShardQuorum {
        let leader = self.leader().expect("no leader");
        let idx = self.node_index(leader);
        &mut self.nodes[idx]
    }

    fn cleanup(self) {
        drop(self.nodes);
        for dir in &self.dirs {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

fn create_shard_op() -> ShardOp {
    ShardOp::CreateShard {
        context_id: 1,
        table_id: 1,
        shard_id: 1,
        track_id: 0,
        first_key: vec![],
        last_key: vec![],
        use_bloom_filter: true,
        storage_type: StorageType::Normal,
    }
}

fn set_op(key: &[u8], value: &[u8]) -> ShardOp {
    ShardOp::Set {
        context_id: 1,
        shard_id: 1,
        key: key.to_vec(),
        value: value.to_vec(),
    }
}

fn request_and_wait(cluster: &mut Cluster, ops: Vec<ShardOp>) -> Result<(), ShardError> {
    let result: Rc<RefCell<Option<Result<(), ShardError>>>> = Rc::new(RefCell::new(None));
    let slot = result.clone();
    let now = cluster.now;
    cluster.leader_node().request(
        ops,
        Some(Box::new(move |outcome| {
            *slot.borrow_mut() = Some(outcome);
        })),
        now,
    );
    assert!(
        cluster.run_until(5000, |_| result.borrow().is_some()),
        "request did not complete"
    );
    let outcome = result.borrow_mut().take().unwrap();
    outcome
}

#[test]
fn leader_election_and_replicated_writes() {
    let mut cluster = Cluster::new("cluster-writes", 3);

    assert!(
        cluster.run_until(5000, |c| c.leader().is_some()),
        "no leader elected"
    );

    request_and_wait(&mut cluster, vec![create_shard_op()]).unwrap();
    request_and_wait(
        &mut cluster,
        vec![set_op(b"alpha", b"1"), set_op(b"beta", b"2")],
    )
    .unwrap();

    // leader-local read
    let now = cluster.now;
    assert_eq!(cluster.leader_node().get(1, 1, b"alpha", now).unwrap(), b"1");
    assert_eq!(
        cluster.leader_node().get(1, 1, b"missing", now),
        Err(ShardError::NotFound)
    );

    // every replica applied the writes to its own storage
    for i in 0..3 {
        let env = cluster.nodes[i].storage();
        env.wait_jobs_idle().unwrap();
        assert_eq!(
            env.get(1, 1, b"alpha").unwrap(),
            GetResult::Value(b"1".to_vec()),
            "node {} missing alpha",
            i + 1
        );
        assert_eq!(
            env.get(1, 1, b"beta").unwrap(),
            GetResult::Value(b"2".to_vec())
        );
    }

    cluster.cleanup();
}

#[test]
fn leader_failover_within_two_durations() {
    let mut cluster = Cluster::new("cluster-failover", 3);

    assert!(cluster.run_until(5000, |c| c.leader().is_some()));
    request_and_wait(&mut cluster, vec![create_shard_op()]).unwrap();
    request_and_wait(&mut cluster, vec![set_op(b"before", b"x")]).unwrap();

    let old_leader = cluster.leader().unwrap();
    cluster.down.insert(old_leader);
    let failover_started = cluster.now;

    assert!(
        cluster.run_until(5000, |c| c.leader().is_some()),
        "no new leader after failover"
    );
    let new_leader = cluster.leader().unwrap();
    assert_ne!(new_leader, old_leader);
    assert!(
        cluster.now - failover_started <= 2 * LEASE_MS,
        "failover took {} ms",
        cluster.now - failover_started
    );

    // the new leader can append
    request_and_wait(&mut cluster, vec![set_op(b"after", b"y")]).unwrap();
    let now = cluster.now;
    assert_eq!(cluster.leader_node().get(1, 1, b"after", now).unwrap(), b"y");
    assert_eq!(cluster.leader_node().get(1, 1, b"before", now).unwrap(), b"x");

    cluster.cleanup();
}

#[test]
fn non_leader_rejects_requests_with_no_service() {
    let mut cluster = Cluster::new("cluster-noservice", 3);
    assert!(cluster.run_until(5000, |c| c.leader().is_some()));

    let leader = cluster.leader().unwrap();
    let follower_idx = (0..3)
        .find(|i| cluster.node_ids[*i] != leader)
        .unwrap();

    let result: Rc<RefCell<Option<Result<(), ShardError>>>> = Rc::new(RefCell::new(None));
    let slot = result.clone();
    let now = cluster.now;
    cluster.nodes[follower_idx].request(
        vec![create_shard_op()],
        Some(Box::new(move |outcome| {
            *slot.borrow_mut() = Some(outcome);
        })),
        now,
    );
    assert_eq!(
        result.borrow_mut().take().unwrap(),
        Err(ShardError::NoService)
    );

    // reads are leader-local too
    assert_eq!(
        cluster.nodes[follower_idx].get(1, 1, b"k", now),
        Err(ShardError::NoService)
    );

    cluster.cleanup();
}

#[test]
fn lagging_follower_catches_up() {
    let mut cluster = Cluster::new("cluster-lag", 3);
    assert!(cluster.run_until(5000, |c| c.leader().is_some()));
    request_and_wait(&mut cluster, vec![create_shard_op()]).unwrap();

    let leader = cluster.leader().unwrap();
    let lagging = *cluster
        .node_ids
        .clone()
        .iter()
        .find(|id| **id != leader)
        .unwrap();

    cluster.down.insert(lagging);
    request_and_wait(&mut cluster, vec![set_op(b"one", b"1")]).unwrap();
    request_and_wait(&mut cluster, vec![set_op(b"two", b"2")]).unwrap();

    cluster.down.remove(&lagging);
    // further traffic makes the lagging node notice and pull missed values
    request_and_wait(&mut cluster, vec![set_op(b"three", b"3")]).unwrap();

    let idx = cluster.node_index(lagging);
    let caught_up = cluster.run_until(5000, |c| {
        let idx = c.node_index(lagging);
        let env = c.nodes[idx].storage();
        matches!(env.get(1, 1, b"one"), Ok(GetResult::Value(_)))
            && matches!(env.get(1, 1, b"three"), Ok(GetResult::Value(_)))
    });
    assert!(caught_up, "lagging node never caught up");

    let env = cluster.nodes[idx].storage();
    assert_eq!(env.get(1, 1, b"two").unwrap(), GetResult::Value(b"2".to_vec()));

    cluster.cleanup();
}
