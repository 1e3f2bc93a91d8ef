use crate::container::ContainerState;
use crate::ids::{ContainerId, NodeId};
use std::collections::HashMap;

/// A physical copy of a container as last reported by a datanode. Purely
/// derived state: rebuilt from container reports, never written to the
/// replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerReplica {
    pub container: ContainerId,
    pub node: NodeId,
    pub reported_state: ContainerState,
    pub bytes_used: u64,
    pub key_count: u64,
    pub last_seen_ms: u64,
}

/// Replica index keyed by container, then node. Each (container, node) pair
/// appears at most once; updates are idempotent.
#[derive(Debug, Default)]
pub struct ReplicaIndex {
    by_container: HashMap<ContainerId, HashMap<NodeId, ContainerReplica>>,
}

impl ReplicaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, replica: ContainerReplica) {
        self.by_container
            .entry(replica.container)
            .or_default()
            .insert(replica.node, replica);
    }

    pub fn remove(&mut self, container: ContainerId, node: &NodeId) {
        if let Some(replicas) = self.by_container.get_mut(&container) {
            replicas.remove(node);
            if replicas.is_empty() {
                self.by_container.remove(&container);
            }
        }
    }

    pub fn drop_container(&mut self, container: ContainerId) {
        self.by_container.remove(&container);
    }

    pub fn replicas_of(&self, container: ContainerId) -> Vec<&ContainerReplica> {
        self.by_container
            .get(&container)
            .map(|replicas| replicas.values().collect())
            .unwrap_or_default()
    }

    pub fn replica_count(&self, container: ContainerId) -> usize {
        self.by_container
            .get(&container)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn containers_reported(&self) -> usize {
        self.by_container.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(container: u64, node: NodeId, bytes: u64) -> ContainerReplica {
        ContainerReplica {
            container: ContainerId::new(container),
            node,
            reported_state: ContainerState::Open,
            bytes_used: bytes,
            key_count: 1,
            last_seen_ms: 0,
        }
    }

    #[test]
    fn update_is_idempotent_per_pair() {
        let mut index = ReplicaIndex::new();
        let node = NodeId::random();
        index.update(replica(1, node, 100));
        index.update(replica(1, node, 250));
        assert_eq!(index.replica_count(ContainerId::new(1)), 1);
        assert_eq!(
            index.replicas_of(ContainerId::new(1))[0].bytes_used,
            250
        );
    }

    #[test]
    fn remove_clears_empty_containers() {
        let mut index = ReplicaIndex::new();
        let node = NodeId::random();
        index.update(replica(1, node, 100));
        index.remove(ContainerId::new(1), &node);
        assert_eq!(index.replica_count(ContainerId::new(1)), 0);
        assert_eq!(index.containers_reported(), 0);
        // Removing again is harmless.
        index.remove(ContainerId::new(1), &node);
    }

    #[test]
    fn distinct_nodes_accumulate() {
        let mut index = ReplicaIndex::new();
        index.update(replica(7, NodeId::random(), 1));
        index.update(replica(7, NodeId::random(), 2));
        index.update(replica(7, NodeId::random(), 3));
        assert_eq!(index.replica_count(ContainerId::new(7)), 3);
    }
}
