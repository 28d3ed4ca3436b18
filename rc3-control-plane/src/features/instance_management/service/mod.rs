pub mod allocator;

use crate::features::cluster::repo::{ClusterError, ClusterRepository, ContainerSpec, TaskId};
use crate::features::cluster::{bounded, within_deadline};
use crate::features::inventory::service::InventoryService;
use crate::features::observability::service::ObservabilityService;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{
    CreateInstanceRequest, CreatedInstance, DeleteInstanceRequest, InstanceKind, InstanceSize,
    Requester,
};
use allocator::IdAllocator;
use rc3_core::{tags, PlacementStrategy, ProfileResolver};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Total create attempts per request. The first conflict on an allocated id
/// gets one fresh id; a second conflict is reported.
pub const MAX_CREATE_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStage {
    Validated,
    Placed,
    Allocated,
    Submitted,
    Created,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStage {
    Requested,
    OwnershipChecked,
    Submitted,
    Deleted,
    Denied,
    Failed,
}

impl fmt::Display for CreationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            CreationStage::Validated => "validated",
            CreationStage::Placed => "placed",
            CreationStage::Allocated => "allocated",
            CreationStage::Submitted => "submitted",
            CreationStage::Created => "created",
            CreationStage::Failed => "failed",
        };
        f.write_str(stage)
    }
}

impl fmt::Display for DeletionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            DeletionStage::Requested => "requested",
            DeletionStage::OwnershipChecked => "ownership_checked",
            DeletionStage::Submitted => "submitted",
            DeletionStage::Deleted => "deleted",
            DeletionStage::Denied => "denied",
            DeletionStage::Failed => "failed",
        };
        f.write_str(stage)
    }
}

/// Orchestrates container creation and deletion against the cluster
pub struct InstanceService {
    cluster: Arc<dyn ClusterRepository>,
    inventory: Arc<InventoryService>,
    allocator: IdAllocator,
    placement: Arc<dyn PlacementStrategy>,
    profiles: ProfileResolver,
    metrics: Arc<ObservabilityService>,
}

impl InstanceService {
    pub fn new(
        cluster: Arc<dyn ClusterRepository>,
        inventory: Arc<InventoryService>,
        placement: Arc<dyn PlacementStrategy>,
        profiles: ProfileResolver,
        metrics: Arc<ObservabilityService>,
    ) -> Self {
        Self {
            allocator: IdAllocator::new(cluster.clone()),
            cluster,
            inventory,
            placement,
            profiles,
            metrics,
        }
    }

    /// Create a container of the requested size, owned by `requester`
    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
        requester: &Requester,
        deadline: Instant,
    ) -> ControlPlaneResult<CreatedInstance> {
        let result = self.run_creation(&request, requester, deadline).await;

        match &result {
            Ok(created) => {
                self.metrics.record_operation("create", "created");
                info!(
                    instance_id = created.id,
                    node = %created.node,
                    task = %created.task,
                    owner = %requester.identity,
                    "Instance created successfully"
                );
            }
            Err(e) => {
                self.metrics.record_operation("create", &outcome(e));
                debug!(stage = %CreationStage::Failed, error = %e, "Instance creation failed");
            }
        }

        result
    }

    async fn run_creation(
        &self,
        request: &CreateInstanceRequest,
        requester: &Requester,
        deadline: Instant,
    ) -> ControlPlaneResult<CreatedInstance> {
        let kind: InstanceKind = request.kind.parse()?;
        let size: InstanceSize = request.size.parse()?;

        if kind == InstanceKind::VirtualMachine {
            return Err(ControlPlaneError::Unsupported(
                "virtual machine creation is not supported".to_string(),
            ));
        }

        let profile = self.profiles.resolve(size)?;
        let tag = tags::encode(&requester.identity, size)?;
        let spec = ContainerSpec::from_profile(&profile, tag);
        debug!(stage = %CreationStage::Validated, %kind, %size, "Creation request validated");

        let nodes = bounded(deadline, "list nodes", self.cluster.list_nodes()).await?;
        let placement = self.placement.select(&nodes)?;
        debug!(
            stage = %CreationStage::Placed,
            node = %placement.node,
            strategy = placement.strategy,
            "Instance placed"
        );

        let mut attempt = 1;
        loop {
            let id = self.allocator.allocate(deadline).await?;
            debug!(
                stage = %CreationStage::Allocated,
                instance_id = id,
                attempt,
                "Instance id allocated"
            );

            let submitted = within_deadline(
                deadline,
                "create container",
                self.cluster.create_container(&placement.node, id, &spec),
            )
            .await?;

            match submitted {
                Ok(task) => {
                    debug!(
                        stage = %CreationStage::Submitted,
                        instance_id = id,
                        task = %task,
                        "Container create submitted"
                    );
                    debug!(stage = %CreationStage::Created, instance_id = id, "Instance created");
                    return Ok(CreatedInstance {
                        id,
                        node: placement.node,
                        task,
                    });
                }
                Err(ClusterError::IdConflict(conflicted)) => {
                    self.metrics.record_allocation_conflict();
                    warn!(
                        instance_id = conflicted,
                        attempt,
                        max_attempts = MAX_CREATE_ATTEMPTS,
                        "Allocated instance id was claimed by another request"
                    );
                    if attempt >= MAX_CREATE_ATTEMPTS {
                        return Err(ControlPlaneError::AllocationConflict(conflicted));
                    }
                    attempt += 1;
                }
                Err(e) => return Err(ControlPlaneError::upstream("create container", e)),
            }
        }
    }

    /// Delete a container the requester owns
    pub async fn delete_instance(
        &self,
        request: DeleteInstanceRequest,
        requester: &Requester,
        deadline: Instant,
    ) -> ControlPlaneResult<TaskId> {
        let instance_id = request.instance_id;
        let result = self.run_deletion(instance_id, requester, deadline).await;

        match &result {
            Ok(task) => {
                self.metrics.record_operation("delete", "deleted");
                info!(
                    instance_id,
                    task = %task,
                    owner = %requester.identity,
                    "Instance deleted successfully"
                );
            }
            Err(e) => {
                self.metrics.record_operation("delete", &outcome(e));
                let stage = match e {
                    ControlPlaneError::PermissionDenied(_) => DeletionStage::Denied,
                    _ => DeletionStage::Failed,
                };
                debug!(instance_id, %stage, error = %e, "Instance deletion failed");
            }
        }

        result
    }

    async fn run_deletion(
        &self,
        instance_id: u64,
        requester: &Requester,
        deadline: Instant,
    ) -> ControlPlaneResult<TaskId> {
        if instance_id == 0 {
            return Err(ControlPlaneError::InvalidRequest(
                "instance id must be a positive integer".to_string(),
            ));
        }
        debug!(instance_id, stage = %DeletionStage::Requested, "Deletion requested");

        let instance = self
            .inventory
            .find(instance_id, deadline)
            .await?
            .ok_or_else(|| ControlPlaneError::NotFound(instance_id.to_string()))?;

        if instance.kind == InstanceKind::VirtualMachine {
            return Err(ControlPlaneError::Unsupported(
                "virtual machine deletion is not supported".to_string(),
            ));
        }

        if !instance.is_owned_by(&requester.identity) {
            warn!(
                instance_id,
                requester = %requester.identity,
                "Deletion denied for instance owned by someone else"
            );
            return Err(ControlPlaneError::PermissionDenied(format!(
                "instance {instance_id} is not owned by the requester"
            )));
        }
        debug!(
            instance_id,
            stage = %DeletionStage::OwnershipChecked,
            node = %instance.node,
            "Ownership confirmed"
        );

        // The instance can change hands between the scan above and this call;
        // the cluster offers no conditional delete.
        let task = bounded(
            deadline,
            "delete container",
            self.cluster.delete_container(&instance.node, instance_id),
        )
        .await?;
        debug!(
            instance_id,
            stage = %DeletionStage::Submitted,
            task = %task,
            "Container delete submitted"
        );
        debug!(instance_id, stage = %DeletionStage::Deleted, "Instance deleted");

        Ok(task)
    }
}

fn outcome(err: &ControlPlaneError) -> String {
    err.code().as_str().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::cluster::repo::{
        InMemoryClusterRepository, MockClusterRepository, ResourceRecord,
    };
    use rc3_core::{FirstNode, NodeSummary};
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn create_test_service(cluster: Arc<dyn ClusterRepository>) -> InstanceService {
        let inventory = Arc::new(InventoryService::new(cluster.clone()));
        InstanceService::new(
            cluster,
            inventory,
            Arc::new(FirstNode),
            ProfileResolver::new(
                "local:vztmpl/ubuntu-22.04-standard_22.04-1_amd64.tar.zst",
                "local-lvm",
            ),
            Arc::new(ObservabilityService::standalone().unwrap()),
        )
    }

    fn owned_container(id: u64, owner: &str) -> ResourceRecord {
        ResourceRecord {
            id,
            name: format!("CT{id}"),
            status: "running".to_string(),
            tags: format!("size=small,owner={owner}"),
            ..ResourceRecord::default()
        }
    }

    fn alice() -> Requester {
        Requester::new("alice")
    }

    #[tokio::test]
    async fn test_create_instance_success() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        let service = create_test_service(cluster.clone());

        let created = service
            .create_instance(
                CreateInstanceRequest::new("container", "medium"),
                &alice(),
                deadline(),
            )
            .await
            .unwrap();

        assert_eq!(created.id, 100);
        assert_eq!(created.node, "pve");
        assert!(created.task.starts_with("UPID:pve"));

        let (node, id, spec) = cluster.created().remove(0);
        assert_eq!((node.as_str(), id), ("pve", 100));
        assert_eq!(spec.tags, "size=medium,owner=alice");
        assert_eq!(spec.option("memory"), Some("4096"));
        assert_eq!(spec.option("rootfs"), Some("local-lvm:60"));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_size_without_cluster_calls() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        let service = create_test_service(cluster.clone());

        let err = service
            .create_instance(
                CreateInstanceRequest::new("container", "xlarge"),
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::InvalidRequest(_)));
        assert_eq!(cluster.list_node_calls(), 0);
        assert_eq!(cluster.next_id_calls(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_kind() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        let service = create_test_service(cluster.clone());

        let err = service
            .create_instance(
                CreateInstanceRequest::new("", "small"),
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::InvalidRequest(_)));
        assert_eq!(cluster.list_node_calls(), 0);
    }

    #[tokio::test]
    async fn test_create_vm_is_unsupported_without_cluster_calls() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        let service = create_test_service(cluster.clone());

        let err = service
            .create_instance(
                CreateInstanceRequest::new("vm", "small"),
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::Unsupported(_)));
        assert_eq!(cluster.list_node_calls(), 0);
        assert_eq!(cluster.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_owner_with_delimiter() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        let service = create_test_service(cluster.clone());

        let err = service
            .create_instance(
                CreateInstanceRequest::new("container", "small"),
                &Requester::new("alice,owner=mallory"),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::InvalidRequest(_)));
        assert_eq!(cluster.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_create_with_no_nodes_is_no_capacity() {
        let cluster = Arc::new(InMemoryClusterRepository::new());
        let service = create_test_service(cluster.clone());

        let err = service
            .create_instance(
                CreateInstanceRequest::new("container", "small"),
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::NoCapacity(_)));
        assert_eq!(cluster.list_node_calls(), 1);
        assert_eq!(cluster.next_id_calls(), 0);
    }

    #[tokio::test]
    async fn test_create_node_listing_failure() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        cluster.fail_list_nodes();
        let service = create_test_service(cluster.clone());

        let err = service
            .create_instance(
                CreateInstanceRequest::new("container", "small"),
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ControlPlaneError::UpstreamUnavailable { ref step, .. } if step == "list nodes"
        ));
    }

    #[tokio::test]
    async fn test_create_allocation_failure() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        cluster.fail_next_id();
        let service = create_test_service(cluster.clone());

        let err = service
            .create_instance(
                CreateInstanceRequest::new("container", "small"),
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ControlPlaneError::UpstreamUnavailable { ref step, .. } if step == "allocate id"
        ));
        assert_eq!(cluster.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_creations_with_duplicated_id_both_succeed() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        cluster.script_next_ids([100, 100]);
        let service = create_test_service(cluster.clone());
        let alice = alice();
        let bob = Requester::new("bob");

        let (first, second) = tokio::join!(
            service.create_instance(
                CreateInstanceRequest::new("container", "small"),
                &alice,
                deadline(),
            ),
            service.create_instance(
                CreateInstanceRequest::new("container", "large"),
                &bob,
                deadline(),
            ),
        );
        let first = first.unwrap();
        let second = second.unwrap();

        let mut ids = vec![first.id, second.id];
        ids.sort_unstable();
        assert_eq!(ids, vec![100, 101]);
        assert_eq!(cluster.container_ids(), vec![100, 101]);
        assert_eq!(cluster.next_id_calls(), 3);
        assert_eq!(cluster.create_calls(), 3);
        assert_eq!(service.metrics.allocation_conflicts(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retry_budget_is_allocation_conflict() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        cluster.add_container("pve", owned_container(100, "carol"));
        cluster.script_next_ids([100, 100]);
        let service = create_test_service(cluster.clone());

        let err = service
            .create_instance(
                CreateInstanceRequest::new("container", "small"),
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::AllocationConflict(100)));
        assert_eq!(cluster.create_calls(), MAX_CREATE_ATTEMPTS);
        assert_eq!(cluster.next_id_calls(), MAX_CREATE_ATTEMPTS);
        assert_eq!(cluster.container_ids(), vec![100]);
        assert_eq!(service.metrics.allocation_conflicts(), 2);
    }

    #[tokio::test]
    async fn test_create_upstream_rejection_is_not_retried() {
        let mut cluster = MockClusterRepository::new();
        cluster
            .expect_list_nodes()
            .returning(|| Ok(vec![NodeSummary::new("pve")]));
        cluster.expect_next_id().times(1).returning(|| Ok(100));
        cluster.expect_create_container().times(1).returning(|_, _, _| {
            Err(ClusterError::Upstream {
                status: 500,
                message: "storage 'local-lvm' does not exist".to_string(),
            })
        });
        let service = create_test_service(Arc::new(cluster));

        let err = service
            .create_instance(
                CreateInstanceRequest::new("container", "small"),
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        match err {
            ControlPlaneError::UpstreamUnavailable { step, message } => {
                assert_eq!(step, "create container");
                assert!(message.contains("does not exist"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_own_container() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve-a", "pve-b"]));
        cluster.add_container("pve-b", owned_container(150, "alice"));
        let service = create_test_service(cluster.clone());

        let task = service
            .delete_instance(
                DeleteInstanceRequest { instance_id: 150 },
                &alice(),
                deadline(),
            )
            .await
            .unwrap();

        assert_eq!(task, "UPID:pve-b:vzdestroy:150");
        assert!(cluster.container_ids().is_empty());
    }

    #[tokio::test]
    async fn test_delete_zero_id_is_invalid() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        let service = create_test_service(cluster.clone());

        let err = service
            .delete_instance(
                DeleteInstanceRequest { instance_id: 0 },
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::InvalidRequest(_)));
        assert_eq!(cluster.list_node_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_unknown_id_is_not_found() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        let service = create_test_service(cluster.clone());

        let err = service
            .delete_instance(
                DeleteInstanceRequest { instance_id: 404 },
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::NotFound(_)));
        assert_eq!(cluster.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_vm_is_unsupported() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        cluster.add_vm("pve", owned_container(300, "alice"));
        let service = create_test_service(cluster.clone());

        let err = service
            .delete_instance(
                DeleteInstanceRequest { instance_id: 300 },
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::Unsupported(_)));
        assert_eq!(cluster.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_by_non_owner_is_denied_in_memory() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        cluster.add_container("pve", owned_container(100, "bob"));
        let service = create_test_service(cluster.clone());

        let err = service
            .delete_instance(
                DeleteInstanceRequest { instance_id: 100 },
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::PermissionDenied(_)));
        assert_eq!(cluster.delete_calls(), 0);
        assert_eq!(cluster.container_ids(), vec![100]);
    }

    #[tokio::test]
    async fn test_delete_by_non_owner_never_calls_cluster_delete() {
        let mut cluster = MockClusterRepository::new();
        cluster
            .expect_list_nodes()
            .returning(|| Ok(vec![NodeSummary::new("pve")]));
        cluster
            .expect_list_containers()
            .returning(|_| Ok(vec![owned_container(100, "bob")]));
        cluster.expect_list_vms().returning(|_| Ok(vec![]));
        cluster.expect_delete_container().times(0);
        let service = create_test_service(Arc::new(cluster));

        let err = service
            .delete_instance(
                DeleteInstanceRequest { instance_id: 100 },
                &alice(),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_delete_untagged_container_is_denied() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        cluster.add_container(
            "pve",
            ResourceRecord {
                id: 100,
                ..ResourceRecord::default()
            },
        );
        let service = create_test_service(cluster.clone());

        let err = service
            .delete_instance(
                DeleteInstanceRequest { instance_id: 100 },
                &Requester::new(""),
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControlPlaneError::PermissionDenied(_)));
        assert_eq!(cluster.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_created_instance_can_be_deleted_by_creator() {
        let cluster = Arc::new(InMemoryClusterRepository::with_nodes(["pve"]));
        let service = create_test_service(cluster.clone());

        let created = service
            .create_instance(
                CreateInstanceRequest::new("container", "small"),
                &alice(),
                deadline(),
            )
            .await
            .unwrap();
        let denied = service
            .delete_instance(
                DeleteInstanceRequest { instance_id: created.id },
                &Requester::new("bob"),
                deadline(),
            )
            .await;
        assert!(matches!(denied, Err(ControlPlaneError::PermissionDenied(_))));

        service
            .delete_instance(
                DeleteInstanceRequest { instance_id: created.id },
                &alice(),
                deadline(),
            )
            .await
            .unwrap();
        assert!(cluster.container_ids().is_empty());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(CreationStage::Allocated.to_string(), "allocated");
        assert_eq!(DeletionStage::OwnershipChecked.to_string(), "ownership_checked");
        assert_eq!(
            outcome(&ControlPlaneError::AllocationConflict(1)),
            "allocation_conflict"
        );
    }
}
