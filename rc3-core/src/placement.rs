//! Placement of new instances onto cluster nodes

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// What the cluster reports about a node at listing time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub name: String,
    pub status: String,
    pub cpu: f64,
    pub max_cpu: u32,
    pub mem: u64,
    pub max_mem: u64,
}

impl NodeSummary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: "online".to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    pub node: String,
    pub strategy: &'static str,
}

/// Chooses the node that hosts a new instance.
///
/// Implementations must be pure: the caller hands in a freshly fetched
/// inventory and acts on the decision immediately.
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, nodes: &[NodeSummary]) -> Result<PlacementDecision>;
}

/// Picks the first node in the listing. Only correct while the cluster has a
/// single node.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstNode;

impl PlacementStrategy for FirstNode {
    fn name(&self) -> &'static str {
        "first_node"
    }

    fn select(&self, nodes: &[NodeSummary]) -> Result<PlacementDecision> {
        let node = nodes.first().ok_or(CoreError::NoNodesAvailable)?;

        Ok(PlacementDecision {
            node: node.name.clone(),
            strategy: self.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_node_picks_listing_head() {
        let nodes = vec![NodeSummary::new("pve-a"), NodeSummary::new("pve-b")];
        let decision = FirstNode.select(&nodes).unwrap();
        assert_eq!(decision.node, "pve-a");
        assert_eq!(decision.strategy, "first_node");
    }

    #[test]
    fn test_first_node_empty_inventory() {
        assert_eq!(FirstNode.select(&[]), Err(CoreError::NoNodesAvailable));
    }

    #[test]
    fn test_strategy_is_object_safe() {
        let strategy: Box<dyn PlacementStrategy> = Box::new(FirstNode);
        let decision = strategy.select(&[NodeSummary::new("only")]).unwrap();
        assert_eq!(decision.node, "only");
    }
}
