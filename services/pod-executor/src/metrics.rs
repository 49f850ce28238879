//! Metrics sink.
//!
//! Components receive an `Arc<dyn MetricsSink>` at construction instead of
//! touching process-wide state. The default sink turns every observation
//! into a `debug!` event so the numbers land in the structured log.

use std::fmt::Debug;
use std::time::Duration;

use tracing::debug;

/// Destination for counters, timings and gauges.
pub trait MetricsSink: Send + Sync + Debug {
    fn incr_counter(&self, name: &'static str, labels: &[(&'static str, &str)]);

    fn observe_duration(&self, name: &'static str, value: Duration, labels: &[(&'static str, &str)]);

    fn set_gauge(&self, name: &'static str, value: f64);
}

/// Emits metrics as tracing events on the `metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn incr_counter(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        debug!(target: "metrics", metric = name, labels = ?labels, "counter +1");
    }

    fn observe_duration(&self, name: &'static str, value: Duration, labels: &[(&'static str, &str)]) {
        debug!(
            target: "metrics",
            metric = name,
            ms = value.as_millis() as u64,
            labels = ?labels,
            "duration"
        );
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        debug!(target: "metrics", metric = name, value = value, "gauge");
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _labels: &[(&'static str, &str)]) {}

    fn observe_duration(&self, _name: &'static str, _value: Duration, _labels: &[(&'static str, &str)]) {}

    fn set_gauge(&self, _name: &'static str, _value: f64) {}
}
