//! Storage node identity and the coordinator's capacity registry.

use crate::error::{BasaltError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Mutex;

/// Network identity of a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A node as declared in configuration: its address and how many blocks of
/// primary and replica space it offers.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub addr: NodeAddr,
    pub primary_capacity: u64,
    pub replica_capacity: u64,
}

/// Nodes chosen to hold one physical block.
#[derive(Debug, Clone)]
pub struct BlockTargets {
    pub primary: NodeAddr,
    pub replicas: Vec<NodeAddr>,
}

#[derive(Debug)]
struct NodeState {
    addr: NodeAddr,
    primary_capacity: u64,
    replica_capacity: u64,
    primary_used: u64,
    replica_used: u64,
}

impl NodeState {
    fn primary_free(&self) -> u64 {
        self.primary_capacity.saturating_sub(self.primary_used)
    }

    fn replica_free(&self) -> u64 {
        self.replica_capacity.saturating_sub(self.replica_used)
    }
}

/// Tracks which storage nodes exist and how much primary/replica block
/// capacity each has left. Counters are committed at selection time, so two
/// concurrent uploads cannot oversubscribe a node; callers release the
/// counters again when an allocation is unwound or a file is deleted.
///
/// The registry carries its own lock and is never held across node I/O.
pub struct NodeRegistry {
    nodes: Mutex<Vec<NodeState>>,
}

impl NodeRegistry {
    pub fn new(specs: Vec<NodeSpec>) -> Self {
        let nodes = specs
            .into_iter()
            .map(|spec| NodeState {
                addr: spec.addr,
                primary_capacity: spec.primary_capacity,
                replica_capacity: spec.replica_capacity,
                primary_used: 0,
                replica_used: 0,
            })
            .collect();
        Self {
            nodes: Mutex::new(nodes),
        }
    }

    /// All registered node addresses, in registration order.
    pub async fn addrs(&self) -> Vec<NodeAddr> {
        let nodes = self.nodes.lock().await;
        nodes.iter().map(|node| node.addr.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.lock().await.is_empty()
    }

    /// Pick a primary and `replica_count` distinct replica nodes for one
    /// block and commit their capacity counters. Nodes with the most free
    /// space win; ties go to the earlier-registered node.
    pub async fn select_targets(&self, replica_count: usize) -> Result<BlockTargets> {
        let mut nodes = self.nodes.lock().await;

        let Some(primary_idx) = pick_primary(&nodes) else {
            return Err(BasaltError::AllocationFailed(
                "no storage node has free primary space".to_string(),
            ));
        };

        let mut replica_idxs = Vec::with_capacity(replica_count);
        for _ in 0..replica_count {
            match pick_replica(&nodes, primary_idx, &replica_idxs) {
                Some(idx) => {
                    nodes[idx].replica_used += 1;
                    replica_idxs.push(idx);
                }
                None => {
                    for &idx in &replica_idxs {
                        nodes[idx].replica_used -= 1;
                    }
                    return Err(BasaltError::AllocationFailed(format!(
                        "need {} distinct replica nodes, found {}",
                        replica_count,
                        replica_idxs.len()
                    )));
                }
            }
        }
        nodes[primary_idx].primary_used += 1;

        Ok(BlockTargets {
            primary: nodes[primary_idx].addr.clone(),
            replicas: replica_idxs
                .iter()
                .map(|&idx| nodes[idx].addr.clone())
                .collect(),
        })
    }

    /// Return one block's worth of capacity to its nodes. Unknown addresses
    /// are ignored so releases stay safe after a configuration change.
    pub async fn release_targets(&self, primary: &NodeAddr, replicas: &[NodeAddr]) {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.iter_mut().find(|node| node.addr == *primary) {
            node.primary_used = node.primary_used.saturating_sub(1);
        }
        for replica in replicas {
            if let Some(node) = nodes.iter_mut().find(|node| node.addr == *replica) {
                node.replica_used = node.replica_used.saturating_sub(1);
            }
        }
    }

    /// Replay an already-allocated block into the counters. Used at startup
    /// to rebuild usage from the persisted block table.
    pub async fn apply_existing(&self, primary: &NodeAddr, replicas: &[NodeAddr]) {
        let mut nodes = self.nodes.lock().await;
        match nodes.iter_mut().find(|node| node.addr == *primary) {
            Some(node) => node.primary_used += 1,
            None => tracing::warn!(
                "allocated block references unknown primary node {}",
                primary
            ),
        }
        for replica in replicas {
            match nodes.iter_mut().find(|node| node.addr == *replica) {
                Some(node) => node.replica_used += 1,
                None => tracing::warn!("allocated block references unknown replica node {}", replica),
            }
        }
    }
}

fn pick_primary(nodes: &[NodeState]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, node) in nodes.iter().enumerate() {
        if node.primary_free() == 0 {
            continue;
        }
        let better = match best {
            Some(current) => node.primary_free() > nodes[current].primary_free(),
            None => true,
        };
        if better {
            best = Some(idx);
        }
    }
    best
}

fn pick_replica(nodes: &[NodeState], primary_idx: usize, taken: &[usize]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, node) in nodes.iter().enumerate() {
        if idx == primary_idx || taken.contains(&idx) || node.replica_free() == 0 {
            continue;
        }
        let better = match best {
            Some(current) => node.replica_free() > nodes[current].replica_free(),
            None => true,
        };
        if better {
            best = Some(idx);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(port: u16, primary: u64, replica: u64) -> NodeSpec {
        NodeSpec {
            addr: NodeAddr::new("127.0.0.1", port),
            primary_capacity: primary,
            replica_capacity: replica,
        }
    }

    #[tokio::test]
    async fn test_select_targets_are_distinct() {
        let registry = NodeRegistry::new(vec![spec(9001, 4, 4), spec(9002, 4, 4), spec(9003, 4, 4)]);

        let targets = registry.select_targets(2).await.unwrap();
        assert!(!targets.replicas.contains(&targets.primary));
        assert_ne!(targets.replicas[0], targets.replicas[1]);
    }

    #[tokio::test]
    async fn test_primary_prefers_most_free_space() {
        let registry = NodeRegistry::new(vec![spec(9001, 1, 0), spec(9002, 5, 1)]);

        let first = registry.select_targets(0).await.unwrap();
        assert_eq!(first.primary.port, 9002);

        // 9002 still has more free primary space than 9001.
        let second = registry.select_targets(0).await.unwrap();
        assert_eq!(second.primary.port, 9002);
    }

    #[tokio::test]
    async fn test_exhausted_primary_capacity_fails() {
        let registry = NodeRegistry::new(vec![spec(9001, 1, 0)]);

        registry.select_targets(0).await.unwrap();
        let err = registry.select_targets(0).await.unwrap_err();
        assert!(matches!(err, BasaltError::AllocationFailed(_)));
    }

    #[tokio::test]
    async fn test_too_few_replica_nodes_rolls_back() {
        let registry = NodeRegistry::new(vec![spec(9001, 2, 2), spec(9002, 2, 2)]);

        // Only one node besides the primary exists, so two replicas cannot
        // be satisfied; the attempt must not leak replica counters.
        let err = registry.select_targets(2).await.unwrap_err();
        assert!(matches!(err, BasaltError::AllocationFailed(_)));

        let targets = registry.select_targets(1).await.unwrap();
        assert_eq!(targets.replicas.len(), 1);
    }

    #[tokio::test]
    async fn test_release_returns_capacity() {
        let registry = NodeRegistry::new(vec![spec(9001, 1, 0), spec(9002, 0, 1)]);

        let targets = registry.select_targets(1).await.unwrap();
        assert!(registry.select_targets(1).await.is_err());

        registry.release_targets(&targets.primary, &targets.replicas).await;
        assert!(registry.select_targets(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_apply_existing_counts_toward_capacity() {
        let registry = NodeRegistry::new(vec![spec(9001, 1, 0)]);

        registry
            .apply_existing(&NodeAddr::new("127.0.0.1", 9001), &[])
            .await;
        let err = registry.select_targets(0).await.unwrap_err();
        assert!(matches!(err, BasaltError::AllocationFailed(_)));
    }
}
