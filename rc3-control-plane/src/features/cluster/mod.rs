pub mod repo;

use std::future::Future;
use tokio::time::{timeout_at, Instant};

use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use repo::ClusterResult;

pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Runs one cluster call against the request deadline. The outer error is the
/// deadline; the inner result is whatever the cluster answered.
pub async fn within_deadline<T, F>(
    deadline: Instant,
    step: &str,
    call: F,
) -> ControlPlaneResult<ClusterResult<T>>
where
    F: Future<Output = ClusterResult<T>>,
{
    timeout_at(deadline, call)
        .await
        .map_err(|_| ControlPlaneError::upstream(step, DEADLINE_EXCEEDED))
}

/// Like [`within_deadline`], with every cluster failure reported as
/// unavailability at `step`.
pub async fn bounded<T, F>(deadline: Instant, step: &str, call: F) -> ControlPlaneResult<T>
where
    F: Future<Output = ClusterResult<T>>,
{
    within_deadline(deadline, step, call)
        .await?
        .map_err(|e| ControlPlaneError::upstream(step, e))
}
