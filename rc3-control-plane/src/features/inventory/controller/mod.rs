use crate::features::inventory::service::InventoryService;
use crate::shared::types::Instance;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

/// Controller for the instance listing endpoint
pub struct InventoryController {
    service: Arc<InventoryService>,
}

impl InventoryController {
    pub fn new(service: Arc<InventoryService>) -> Self {
        Self { service }
    }

    pub async fn list_instances(
        &self,
        deadline: Instant,
    ) -> Result<Vec<Instance>, rc3_core::ErrorResponse> {
        info!("Received list instances request");

        self.service.list_all(deadline).await.map_err(|e| e.into())
    }
}
