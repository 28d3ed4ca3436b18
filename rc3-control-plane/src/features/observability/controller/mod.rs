use crate::features::observability::service::ObservabilityService;
use std::sync::Arc;

pub struct ObservabilityController {
    service: Arc<ObservabilityService>,
}

impl ObservabilityController {
    pub fn new(service: Arc<ObservabilityService>) -> Self {
        Self { service }
    }

    pub fn record_api_request(&self, endpoint: &str, status: u16, seconds: f64) {
        self.service.record_api_request(endpoint, status, seconds);
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        self.service.render_metrics()
    }
}
