//! Lifecycle Metrics
//!
//! Prometheus collectors for lifecycle operations. Each manager owns its own
//! registry so several managers (and tests) can live in one process.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Instant;

use crate::error::{Error, Result};

const NAMESPACE: &str = "cinder_core";

/// Collectors updated by the lifecycle manager
#[derive(Clone)]
pub struct LifecycleMetrics {
    registry: Registry,
    operations: IntCounterVec,
    duration: HistogramVec,
    messages: IntCounterVec,
    locks_held: IntGauge,
}

impl LifecycleMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Lifecycle operations by outcome").namespace(NAMESPACE),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "operation_duration_seconds",
                "Duration of lifecycle operations",
            )
            .namespace(NAMESPACE),
            &["operation"],
        )
        .map_err(metrics_error)?;
        let messages = IntCounterVec::new(
            Opts::new("user_messages_total", "User messages recorded by event id")
                .namespace(NAMESPACE),
            &["event_id"],
        )
        .map_err(metrics_error)?;
        let locks_held = IntGauge::with_opts(
            Opts::new("resource_locks_held", "Resource locks currently held").namespace(NAMESPACE),
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(messages.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(locks_held.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            duration,
            messages,
            locks_held,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gauge handed to the resource lock table
    pub fn locks_held(&self) -> IntGauge {
        self.locks_held.clone()
    }

    /// Start timing an operation
    pub fn start(&self, operation: &'static str) -> OperationTimer {
        OperationTimer {
            operation,
            started: Instant::now(),
        }
    }

    /// Record the outcome of a timed operation
    pub fn finish<T>(&self, timer: OperationTimer, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => "success",
            Err(_) => "failure",
        };
        self.operations
            .with_label_values(&[timer.operation, outcome])
            .inc();
        self.duration
            .with_label_values(&[timer.operation])
            .observe(timer.started.elapsed().as_secs_f64());
    }

    pub fn record_message(&self, event_id: &str) {
        self.messages.with_label_values(&[event_id]).inc();
    }

    pub fn operation_count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[operation, outcome])
            .get()
    }

    /// Text exposition of every collector
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

/// In-progress operation timing
pub struct OperationTimer {
    operation: &'static str,
    started: Instant,
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_counted() {
        let metrics = LifecycleMetrics::new().unwrap();
        let timer = metrics.start("create_volume");
        metrics.finish(timer, &Ok::<_, Error>(()));
        let timer = metrics.start("create_volume");
        metrics.finish(timer, &Err::<(), _>(Error::Internal("x".into())));

        assert_eq!(metrics.operation_count("create_volume", "success"), 1);
        assert_eq!(metrics.operation_count("create_volume", "failure"), 1);
    }

    #[test]
    fn test_encode_exposes_collectors() {
        let metrics = LifecycleMetrics::new().unwrap();
        metrics.record_message("VOLUME_VOLUME_001_002");
        metrics.locks_held().inc();
        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("cinder_core_user_messages_total"));
        assert!(text.contains("cinder_core_resource_locks_held 1"));
    }
}
