use prometheus::{
    opts, Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder,
};

/// Owns the Prometheus registry for one control plane process
pub struct ObservabilityRepository {
    registry: Registry,
    api_request_total: CounterVec,
    api_request_latency_seconds: HistogramVec,
    instance_operations_total: CounterVec,
    allocation_conflicts_total: Counter,
}

impl ObservabilityRepository {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let api_request_total = CounterVec::new(
            opts!("rc3_api_request_total", "REST API requests by endpoint and status"),
            &["endpoint", "status"],
        )?;
        let api_request_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "rc3_api_request_latency_seconds",
                "REST API request latency (seconds)",
            ),
            &["endpoint"],
        )?;
        let instance_operations_total = CounterVec::new(
            opts!(
                "rc3_instance_operations_total",
                "Instance create/delete operations by outcome"
            ),
            &["operation", "outcome"],
        )?;
        let allocation_conflicts_total = Counter::with_opts(opts!(
            "rc3_allocation_conflicts_total",
            "Container creations rejected because the allocated id was already taken"
        ))?;

        registry.register(Box::new(api_request_total.clone()))?;
        registry.register(Box::new(api_request_latency_seconds.clone()))?;
        registry.register(Box::new(instance_operations_total.clone()))?;
        registry.register(Box::new(allocation_conflicts_total.clone()))?;

        Ok(Self {
            registry,
            api_request_total,
            api_request_latency_seconds,
            instance_operations_total,
            allocation_conflicts_total,
        })
    }

    pub fn observe_api_request(&self, endpoint: &str, status: &str, seconds: f64) {
        self.api_request_total
            .with_label_values(&[endpoint, status])
            .inc();
        self.api_request_latency_seconds
            .with_label_values(&[endpoint])
            .observe(seconds);
    }

    pub fn inc_instance_operation(&self, operation: &str, outcome: &str) {
        self.instance_operations_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    pub fn inc_allocation_conflicts(&self) {
        self.allocation_conflicts_total.inc();
    }

    pub fn allocation_conflicts(&self) -> f64 {
        self.allocation_conflicts_total.get()
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buffer).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let first = ObservabilityRepository::new().unwrap();
        let second = ObservabilityRepository::new().unwrap();

        first.inc_allocation_conflicts();

        assert_eq!(first.allocation_conflicts(), 1.0);
        assert_eq!(second.allocation_conflicts(), 0.0);
    }

    #[test]
    fn test_render_contains_labelled_series() {
        let repo = ObservabilityRepository::new().unwrap();
        repo.observe_api_request("create_instance", "201", 0.02);
        repo.inc_instance_operation("create", "created");

        let rendered = repo.render_metrics().unwrap();
        assert!(rendered.contains(
            r#"rc3_api_request_total{endpoint="create_instance",status="201"} 1"#
        ));
        assert!(rendered.contains(
            r#"rc3_instance_operations_total{operation="create",outcome="created"} 1"#
        ));
        assert!(rendered.contains("rc3_api_request_latency_seconds_bucket"));
    }
}
