//! Quorum membership and proposal id arithmetic.

use silo_api_types::NodeId;

/// Width of the node id part of a proposal id.
const PROPOSAL_NODE_BITS: u64 = 16;

/// Globally unique, totally ordered proposal ids:
/// `(restartCounter << 16) | nodeID`. Node ids must fit 16 bits.
pub fn proposal_id(restart_counter: u64, node_id: NodeId) -> u64 {
    debug_assert!(node_id < (1 << PROPOSAL_NODE_BITS));
    (restart_counter << PROPOSAL_NODE_BITS) | node_id
}

/// The smallest own proposal id ordered after everything observed.
pub fn next_proposal_id(observed: u64, node_id: NodeId) -> u64 {
    proposal_id((observed >> PROPOSAL_NODE_BITS) + 1, node_id)
}

/// A fixed set of nodes replicating one shard group.
#[derive(Clone, Debug)]
pub struct Quorum {
    node_id: NodeId,
    nodes: Vec<NodeId>,
}

impl Quorum {
    pub fn new(node_id: NodeId, mut nodes: Vec<NodeId>) -> Self {
        if !nodes.contains(&node_id) {
            nodes.push(node_id);
        }
        nodes.sort_unstable();
        nodes.dedup();
        Self { node_id, nodes }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Votes needed for a majority.
    pub fn majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains(&node_id)
    }

    pub fn other_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .copied()
            .filter(move |id| *id != self.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_id_ordering() {
        let a = proposal_id(1, 2);
        let b = proposal_id(1, 3);
        let c = proposal_id(2, 1);
        assert!(a < b); // equal counter, higher node id wins ties
        assert!(b < c); // higher counter always wins

        assert_eq!(next_proposal_id(c, 5), proposal_id(3, 5));
        assert!(next_proposal_id(b, 1) > b);
    }

    #[test]
    fn majority_sizes() {
        assert_eq!(Quorum::new(1, vec![1]).majority(), 1);
        assert_eq!(Quorum::new(1, vec![1, 2, 3]).majority(), 2);
        assert_eq!(Quorum::new(1, vec![1, 2, 3, 4, 5]).majority(), 3);
        assert_eq!(Quorum::new(1, vec![1, 2, 3, 4]).majority(), 3);
    }

    #[test]
    fn other_nodes_excludes_self() {
        let quorum = Quorum::new(2, vec![1, 2, 3]);
        let others: Vec<_> = quorum.other_nodes().collect();
        assert_eq!(others, vec![1, 3]);
    }
}
