pub mod proxmox;

use async_trait::async_trait;
use rc3_core::{NodeSummary, ResourceProfile};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Errors surfaced by the virtualization cluster
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cluster responded with {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("instance id {0} already exists")]
    IdConflict(u64),
    #[error("could not decode cluster response: {0}")]
    Decode(String),
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Identifier of an asynchronous cluster task (a Proxmox UPID)
pub type TaskId = String;

/// A container or VM as the cluster lists it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRecord {
    pub id: u64,
    pub name: String,
    pub node: String,
    pub status: String,
    pub uptime: u64,
    pub tags: String,
}

/// Everything the cluster needs to create a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub options: Vec<(String, String)>,
    pub tags: String,
}

impl ContainerSpec {
    pub fn from_profile(profile: &ResourceProfile, tags: impl Into<String>) -> Self {
        Self {
            options: profile.container_options(),
            tags: tags.into(),
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Access to the virtualization cluster. Every call is a network round trip
/// and may fail at any point.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterRepository: Send + Sync {
    /// Cluster software version, used as a connectivity check
    async fn version(&self) -> ClusterResult<String>;

    async fn list_nodes(&self) -> ClusterResult<Vec<NodeSummary>>;

    async fn list_containers(&self, node: &str) -> ClusterResult<Vec<ResourceRecord>>;

    async fn list_vms(&self, node: &str) -> ClusterResult<Vec<ResourceRecord>>;

    /// Next unused instance id. Not a reservation: another caller may be
    /// handed the same id until one of them creates it.
    async fn next_id(&self) -> ClusterResult<u64>;

    /// Fails with `ClusterError::IdConflict` when `id` is already taken.
    async fn create_container(
        &self,
        node: &str,
        id: u64,
        spec: &ContainerSpec,
    ) -> ClusterResult<TaskId>;

    async fn delete_container(&self, node: &str, id: u64) -> ClusterResult<TaskId>;
}

#[derive(Default)]
struct InMemoryState {
    nodes: Vec<NodeSummary>,
    containers: HashMap<String, Vec<ResourceRecord>>,
    vms: HashMap<String, Vec<ResourceRecord>>,
    scripted_ids: VecDeque<u64>,
    failing_nodes: bool,
    failing_next_id: bool,
    failing_containers: HashSet<String>,
    failing_vms: HashSet<String>,
    created: Vec<(String, u64, ContainerSpec)>,
}

impl InMemoryState {
    fn id_taken(&self, id: u64) -> bool {
        self.containers
            .values()
            .chain(self.vms.values())
            .flatten()
            .any(|record| record.id == id)
    }
}

#[derive(Default)]
struct CallCounters {
    list_nodes: AtomicUsize,
    next_id: AtomicUsize,
    create: AtomicUsize,
    delete: AtomicUsize,
}

/// Deterministic in-process cluster. Backs tests and `backend = "in_memory"`
/// for local development.
#[derive(Default)]
pub struct InMemoryClusterRepository {
    state: Mutex<InMemoryState>,
    calls: CallCounters,
}

/// Lowest id the cluster hands out, as on Proxmox.
const FIRST_GUEST_ID: u64 = 100;

impl InMemoryClusterRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster with the given nodes and no guests
    pub fn with_nodes<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let repo = Self::new();
        for name in names {
            repo.add_node(NodeSummary::new(name));
        }
        repo
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_node(&self, node: NodeSummary) {
        self.lock().nodes.push(node);
    }

    pub fn add_container(&self, node: &str, mut record: ResourceRecord) {
        record.node = node.to_string();
        self.lock()
            .containers
            .entry(node.to_string())
            .or_default()
            .push(record);
    }

    pub fn add_vm(&self, node: &str, mut record: ResourceRecord) {
        record.node = node.to_string();
        self.lock()
            .vms
            .entry(node.to_string())
            .or_default()
            .push(record);
    }

    /// Ids returned by `next_id` before falling back to the lowest free id
    pub fn script_next_ids(&self, ids: impl IntoIterator<Item = u64>) {
        self.lock().scripted_ids.extend(ids);
    }

    pub fn fail_list_nodes(&self) {
        self.lock().failing_nodes = true;
    }

    pub fn fail_next_id(&self) {
        self.lock().failing_next_id = true;
    }

    pub fn fail_list_containers(&self, node: &str) {
        self.lock().failing_containers.insert(node.to_string());
    }

    pub fn fail_list_vms(&self, node: &str) {
        self.lock().failing_vms.insert(node.to_string());
    }

    pub fn list_node_calls(&self) -> usize {
        self.calls.list_nodes.load(Ordering::SeqCst)
    }

    pub fn next_id_calls(&self) -> usize {
        self.calls.next_id.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.calls.create.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.calls.delete.load(Ordering::SeqCst)
    }

    /// Successful creations in commit order
    pub fn created(&self) -> Vec<(String, u64, ContainerSpec)> {
        self.lock().created.clone()
    }

    pub fn container_ids(&self) -> Vec<u64> {
        let state = self.lock();
        let mut ids: Vec<u64> = state.containers.values().flatten().map(|r| r.id).collect();
        ids.sort_unstable();
        ids
    }

    fn unavailable(what: &str, node: &str) -> ClusterError {
        ClusterError::Upstream {
            status: 595,
            message: format!("no route to node '{node}' while listing {what}"),
        }
    }
}

/// Yield once so concurrent callers interleave the way they would across
/// real network round trips.
async fn round_trip() {
    tokio::task::yield_now().await;
}

#[async_trait]
impl ClusterRepository for InMemoryClusterRepository {
    async fn version(&self) -> ClusterResult<String> {
        round_trip().await;
        Ok("in-memory".to_string())
    }

    async fn list_nodes(&self) -> ClusterResult<Vec<NodeSummary>> {
        self.calls.list_nodes.fetch_add(1, Ordering::SeqCst);
        round_trip().await;

        let state = self.lock();
        if state.failing_nodes {
            return Err(ClusterError::Transport("connection refused".to_string()));
        }
        Ok(state.nodes.clone())
    }

    async fn list_containers(&self, node: &str) -> ClusterResult<Vec<ResourceRecord>> {
        round_trip().await;

        let state = self.lock();
        if state.failing_containers.contains(node) {
            return Err(Self::unavailable("containers", node));
        }
        Ok(state.containers.get(node).cloned().unwrap_or_default())
    }

    async fn list_vms(&self, node: &str) -> ClusterResult<Vec<ResourceRecord>> {
        round_trip().await;

        let state = self.lock();
        if state.failing_vms.contains(node) {
            return Err(Self::unavailable("vms", node));
        }
        Ok(state.vms.get(node).cloned().unwrap_or_default())
    }

    async fn next_id(&self) -> ClusterResult<u64> {
        self.calls.next_id.fetch_add(1, Ordering::SeqCst);
        round_trip().await;

        let mut state = self.lock();
        if state.failing_next_id {
            return Err(ClusterError::Upstream {
                status: 500,
                message: "unable to get next vmid".to_string(),
            });
        }
        if let Some(id) = state.scripted_ids.pop_front() {
            return Ok(id);
        }

        let mut candidate = FIRST_GUEST_ID;
        while state.id_taken(candidate) {
            candidate += 1;
        }
        Ok(candidate)
    }

    async fn create_container(
        &self,
        node: &str,
        id: u64,
        spec: &ContainerSpec,
    ) -> ClusterResult<TaskId> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        round_trip().await;

        let mut state = self.lock();
        if !state.nodes.iter().any(|n| n.name == node) {
            return Err(ClusterError::Upstream {
                status: 500,
                message: format!("no such node '{node}'"),
            });
        }
        if state.id_taken(id) {
            return Err(ClusterError::IdConflict(id));
        }

        let record = ResourceRecord {
            id,
            name: spec
                .option("hostname")
                .map(str::to_string)
                .unwrap_or_else(|| format!("CT{id}")),
            node: node.to_string(),
            status: "stopped".to_string(),
            uptime: 0,
            tags: spec.tags.clone(),
        };
        state
            .containers
            .entry(node.to_string())
            .or_default()
            .push(record);
        state.created.push((node.to_string(), id, spec.clone()));

        Ok(format!("UPID:{node}:vzcreate:{id}"))
    }

    async fn delete_container(&self, node: &str, id: u64) -> ClusterResult<TaskId> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        round_trip().await;

        let mut state = self.lock();
        let containers = state.containers.entry(node.to_string()).or_default();
        let before = containers.len();
        containers.retain(|record| record.id != id);
        if containers.len() == before {
            return Err(ClusterError::Upstream {
                status: 500,
                message: format!("CT {id} does not exist"),
            });
        }

        Ok(format!("UPID:{node}:vzdestroy:{id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, name: &str) -> ResourceRecord {
        ResourceRecord {
            id,
            name: name.to_string(),
            status: "running".to_string(),
            uptime: 30,
            ..ResourceRecord::default()
        }
    }

    fn spec() -> ContainerSpec {
        ContainerSpec {
            options: vec![("memory".to_string(), "2048".to_string())],
            tags: "size=small,owner=alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_next_id_skips_taken_ids() {
        let repo = InMemoryClusterRepository::with_nodes(["pve"]);
        repo.add_container("pve", record(100, "a"));
        repo.add_vm("pve", record(101, "b"));

        assert_eq!(repo.next_id().await.unwrap(), 102);
        assert_eq!(repo.next_id_calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_ids_come_first() {
        let repo = InMemoryClusterRepository::with_nodes(["pve"]);
        repo.script_next_ids([150, 150]);

        assert_eq!(repo.next_id().await.unwrap(), 150);
        assert_eq!(repo.next_id().await.unwrap(), 150);
        assert_eq!(repo.next_id().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let repo = InMemoryClusterRepository::with_nodes(["pve"]);

        repo.create_container("pve", 100, &spec()).await.unwrap();
        let err = repo.create_container("pve", 100, &spec()).await.unwrap_err();

        assert_eq!(err, ClusterError::IdConflict(100));
        assert_eq!(repo.create_calls(), 2);
        assert_eq!(repo.container_ids(), vec![100]);
    }

    #[tokio::test]
    async fn test_created_container_is_listed_with_tags() {
        let repo = InMemoryClusterRepository::with_nodes(["pve"]);
        repo.create_container("pve", 120, &spec()).await.unwrap();

        let containers = repo.list_containers("pve").await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "CT120");
        assert_eq!(containers[0].node, "pve");
        assert_eq!(containers[0].tags, "size=small,owner=alice");
    }

    #[tokio::test]
    async fn test_delete_missing_container_fails() {
        let repo = InMemoryClusterRepository::with_nodes(["pve"]);
        let err = repo.delete_container("pve", 404).await.unwrap_err();
        assert!(matches!(err, ClusterError::Upstream { .. }));
        assert_eq!(repo.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection_is_per_node() {
        let repo = InMemoryClusterRepository::with_nodes(["pve-a", "pve-b"]);
        repo.fail_list_vms("pve-b");

        assert!(repo.list_vms("pve-a").await.is_ok());
        assert!(repo.list_vms("pve-b").await.is_err());
        assert!(repo.list_containers("pve-b").await.is_ok());
    }
}
