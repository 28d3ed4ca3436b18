use crate::features::cluster::bounded;
use crate::features::cluster::repo::ClusterRepository;
use crate::shared::error::ControlPlaneResult;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Hands out instance ids by asking the cluster. The cluster does not reserve
/// the id, so two callers can receive the same one; the create call is what
/// finally claims it.
pub struct IdAllocator {
    cluster: Arc<dyn ClusterRepository>,
}

impl IdAllocator {
    pub fn new(cluster: Arc<dyn ClusterRepository>) -> Self {
        Self { cluster }
    }

    pub async fn allocate(&self, deadline: Instant) -> ControlPlaneResult<u64> {
        let id = bounded(deadline, "allocate id", self.cluster.next_id()).await?;
        debug!(instance_id = id, "Allocated instance id");
        Ok(id)
    }
}
