use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{global, KeyValue};

/// Job counters on the global meter. A no-op until a meter provider is
/// installed by `logger::init_tracing`.
#[derive(Clone, Debug)]
pub struct EngineMetrics {
    jobs_submitted: Counter<u64>,
    jobs_failed: Counter<u64>,
    job_latency_ms: Histogram<f64>,
    runs_finished: Counter<u64>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let meter = global::meter("publish-driver");
        Self {
            jobs_submitted: meter
                .u64_counter("jobs_submitted")
                .with_description("Jobs handed to the worker host")
                .build(),
            jobs_failed: meter
                .u64_counter("jobs_failed")
                .with_description("Jobs lost to a communication failure")
                .build(),
            job_latency_ms: meter
                .f64_histogram("job_latency_ms")
                .with_description("Submit to completion, per job")
                .with_unit("ms")
                .build(),
            runs_finished: meter.u64_counter("runs_finished").build(),
        }
    }

    pub fn submitted(&self, plugin: &str) {
        self.jobs_submitted
            .add(1, &[KeyValue::new("plugin", plugin.to_string())]);
    }

    pub fn failed(&self, plugin: &str) {
        self.jobs_failed
            .add(1, &[KeyValue::new("plugin", plugin.to_string())]);
    }

    pub fn latency(&self, plugin: &str, elapsed_ms: f64) {
        self.job_latency_ms
            .record(elapsed_ms, &[KeyValue::new("plugin", plugin.to_string())]);
    }

    pub fn finished(&self, outcome: &str) {
        self.runs_finished
            .add(1, &[KeyValue::new("outcome", outcome.to_string())]);
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
