use crate::features::cluster::bounded;
use crate::features::cluster::repo::{ClusterRepository, ResourceRecord};
use crate::shared::error::ControlPlaneResult;
use crate::shared::types::{Instance, InstanceKind};
use rc3_core::tags;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Read side of the cluster: the merged view of containers and VMs across
/// every node.
pub struct InventoryService {
    cluster: Arc<dyn ClusterRepository>,
}

impl InventoryService {
    pub fn new(cluster: Arc<dyn ClusterRepository>) -> Self {
        Self { cluster }
    }

    /// Lists every instance in node order, containers before VMs. A failure
    /// on any node fails the whole listing.
    pub async fn list_all(&self, deadline: Instant) -> ControlPlaneResult<Vec<Instance>> {
        let nodes = bounded(deadline, "list nodes", self.cluster.list_nodes()).await?;

        let mut instances = Vec::new();
        for node in &nodes {
            let containers = bounded(
                deadline,
                &format!("list containers on node {}", node.name),
                self.cluster.list_containers(&node.name),
            )
            .await?;
            instances.extend(
                containers
                    .into_iter()
                    .map(|record| to_instance(record, InstanceKind::Container, &node.name)),
            );

            let vms = bounded(
                deadline,
                &format!("list vms on node {}", node.name),
                self.cluster.list_vms(&node.name),
            )
            .await?;
            instances.extend(
                vms.into_iter()
                    .map(|record| to_instance(record, InstanceKind::VirtualMachine, &node.name)),
            );
        }

        debug!(
            nodes = nodes.len(),
            instances = instances.len(),
            "Listed cluster inventory"
        );

        Ok(instances)
    }

    /// Fresh lookup of one instance by id
    pub async fn find(&self, id: u64, deadline: Instant) -> ControlPlaneResult<Option<Instance>> {
        Ok(self
            .list_all(deadline)
            .await?
            .into_iter()
            .find(|instance| instance.id == id))
    }
}

fn to_instance(record: ResourceRecord, kind: InstanceKind, node: &str) -> Instance {
    let tag = tags::decode(&record.tags);

    Instance {
        id: record.id,
        kind,
        size: tag.size,
        name: record.name,
        node: node.to_string(),
        status: record.status,
        uptime: record.uptime,
        owner: tag.owner,
    }
}
