//! Prometheus Metrics
//!
//! Registers the series required by the daemon's `/metrics` surface against
//! one `prometheus::Registry`, owned by the daemon and shared (as
//! `Arc<VibenoteMetrics>`) with `GpuGuard`, `TaskQueue` and `InferenceClient`
//! at construction so each component updates its own series directly rather
//! than the HTTP layer polling internals.

use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::task::TaskClass;

/// Outcome label used on `vibenote_tasks_total`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished,
    Cancelled,
    Rejected,
    Timeout,
}

impl TaskOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
        }
    }
}

/// All Prometheus series owned by the daemon.
pub struct VibenoteMetrics {
    registry: Registry,
    queue_depth: IntGauge,
    queue_depth_by_priority: IntGaugeVec,
    running: IntGaugeVec,
    tasks_total: IntCounterVec,
    gpu_utilization_percent: IntGauge,
    gpu_vram_free_mb: IntGauge,
    inference_reconnect_attempts_total: prometheus::IntCounter,
}

impl VibenoteMetrics {
    /// Create and register every series against a fresh registry.
    ///
    /// # Panics
    /// Panics if a series fails to register, which only happens on a
    /// duplicate-name registration bug caught in tests.
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let queue_depth = IntGauge::new("vibenote_queue_depth", "Total tasks currently queued")
            .expect("valid metric");
        let queue_depth_by_priority = IntGaugeVec::new(
            Opts::new(
                "vibenote_queue_depth_by_priority",
                "Queued tasks by priority lane",
            ),
            &["priority"],
        )
        .expect("valid metric");
        let running = IntGaugeVec::new(
            Opts::new("vibenote_running", "In-flight tasks by class"),
            &["class"],
        )
        .expect("valid metric");
        let tasks_total = IntCounterVec::new(
            Opts::new("vibenote_tasks_total", "Tasks reaching a terminal state"),
            &["class", "outcome"],
        )
        .expect("valid metric");
        let gpu_utilization_percent = IntGauge::new(
            "vibenote_gpu_utilization_percent",
            "Last sampled GPU utilization percentage",
        )
        .expect("valid metric");
        let gpu_vram_free_mb = IntGauge::new(
            "vibenote_gpu_vram_free_mb",
            "Last sampled free VRAM in megabytes",
        )
        .expect("valid metric");
        let inference_reconnect_attempts_total = prometheus::IntCounter::new(
            "vibenote_inference_reconnect_attempts_total",
            "Reconnect attempts made by the inference client",
        )
        .expect("valid metric");

        registry
            .register(Box::new(queue_depth.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(queue_depth_by_priority.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(running.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(tasks_total.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(gpu_utilization_percent.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(gpu_vram_free_mb.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(inference_reconnect_attempts_total.clone()))
            .expect("unique metric name");

        // Ensure every class/priority series reports a zero point at start,
        // rather than being absent until first touched.
        for class in TaskClass::ALL {
            running.with_label_values(&[class.label()]).set(0);
            for outcome in [
                TaskOutcome::Finished,
                TaskOutcome::Cancelled,
                TaskOutcome::Rejected,
                TaskOutcome::Timeout,
            ] {
                tasks_total
                    .with_label_values(&[class.label(), outcome.label()])
                    .reset();
            }
        }
        for priority in crate::task::Priority::ALL {
            queue_depth_by_priority
                .with_label_values(&[priority.label()])
                .set(0);
        }

        Self {
            registry,
            queue_depth,
            queue_depth_by_priority,
            running,
            tasks_total,
            gpu_utilization_percent,
            gpu_vram_free_mb,
            inference_reconnect_attempts_total,
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn set_queue_depth_by_priority(&self, priority: crate::task::Priority, depth: usize) {
        self.queue_depth_by_priority
            .with_label_values(&[priority.label()])
            .set(depth as i64);
    }

    pub fn set_running(&self, class: TaskClass, count: usize) {
        self.running
            .with_label_values(&[class.label()])
            .set(count as i64);
    }

    pub fn record_task_outcome(&self, class: TaskClass, outcome: TaskOutcome) {
        self.tasks_total
            .with_label_values(&[class.label(), outcome.label()])
            .inc();
    }

    pub fn set_gpu_utilization_percent(&self, percent: f32) {
        self.gpu_utilization_percent.set(percent.round() as i64);
    }

    pub fn set_gpu_vram_free_mb(&self, mb: u64) {
        self.gpu_vram_free_mb.set(mb as i64);
    }

    pub fn inc_inference_reconnect_attempts(&self) {
        self.inference_reconnect_attempts_total.inc();
    }

    /// Render the full registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode_to_string(&families)
            .unwrap_or_else(|e| format!("# metrics encoding error: {e}\n"))
    }
}

impl Default for VibenoteMetrics {
    fn default() -> Self {
        Self::new()
    }
}
