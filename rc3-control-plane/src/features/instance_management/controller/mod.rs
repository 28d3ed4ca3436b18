use crate::features::instance_management::service::InstanceService;
use crate::shared::types::{
    CreateInstanceRequest, CreatedInstance, DeleteInstanceRequest, Requester,
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

/// Controller for instance management API endpoints
pub struct InstanceController {
    service: Arc<InstanceService>,
}

impl InstanceController {
    pub fn new(service: Arc<InstanceService>) -> Self {
        Self { service }
    }

    /// Handle create instance request
    /// Thin wrapper that delegates to service
    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
        requester: &Requester,
        deadline: Instant,
    ) -> Result<CreatedInstance, rc3_core::ErrorResponse> {
        info!(
            kind = %request.kind,
            size = %request.size,
            requester = %requester.identity,
            "Received create instance request"
        );

        self.service
            .create_instance(request, requester, deadline)
            .await
            .map_err(|e| e.into())
    }

    /// Handle delete instance request
    pub async fn delete_instance(
        &self,
        request: DeleteInstanceRequest,
        requester: &Requester,
        deadline: Instant,
    ) -> Result<String, rc3_core::ErrorResponse> {
        info!(
            instance_id = request.instance_id,
            requester = %requester.identity,
            "Received delete instance request"
        );

        self.service
            .delete_instance(request, requester, deadline)
            .await
            .map_err(|e| e.into())
    }
}
