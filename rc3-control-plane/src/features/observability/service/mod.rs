use crate::features::observability::repo::ObservabilityRepository;
use std::sync::Arc;

pub struct ObservabilityService {
    repo: Arc<ObservabilityRepository>,
}

impl ObservabilityService {
    pub fn new(repo: Arc<ObservabilityRepository>) -> Self {
        Self { repo }
    }

    /// Fresh registry, for tests and tools that do not export metrics.
    pub fn standalone() -> Result<Self, prometheus::Error> {
        Ok(Self::new(Arc::new(ObservabilityRepository::new()?)))
    }

    pub fn record_api_request(&self, endpoint: &str, status: u16, seconds: f64) {
        self.repo
            .observe_api_request(endpoint, &status.to_string(), seconds);
    }

    pub fn record_operation(&self, operation: &str, outcome: &str) {
        self.repo.inc_instance_operation(operation, outcome);
    }

    pub fn record_allocation_conflict(&self) {
        self.repo.inc_allocation_conflicts();
    }

    pub fn allocation_conflicts(&self) -> u64 {
        self.repo.allocation_conflicts() as u64
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        self.repo.render_metrics()
    }
}
