use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the gateway
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Admission metrics
    admission_decisions: CounterVec,
    auto_blocks: Counter,

    // Broker metrics
    events_published: CounterVec,
    publish_attempts: CounterVec,
    publish_retries: Counter,

    // Service metrics
    policy_reload_success: Counter,
    policy_reload_error: Counter,
    request_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let admission_decisions = CounterVec::new(
            Opts::new(
                "gateway_admission_decisions_total",
                "Admission decisions by route and reason (reason=none means admitted)",
            ),
            &["route", "reason"],
        )?;

        let auto_blocks = Counter::new(
            "gateway_ip_auto_blocks_total",
            "Number of source addresses blocked after repeated violations",
        )?;

        let events_published = CounterVec::new(
            Opts::new(
                "gateway_events_published_total",
                "Events handed to the broker, by destination kind and result",
            ),
            &["destination", "result"],
        )?;

        let publish_attempts = CounterVec::new(
            Opts::new(
                "gateway_publish_attempts_total",
                "Individual broker publish attempts by result",
            ),
            &["result"],
        )?;

        let publish_retries = Counter::new(
            "gateway_publish_retries_total",
            "Number of publish attempts that were retries",
        )?;

        let policy_reload_success = Counter::new(
            "gateway_policy_reload_success",
            "Number of successful policy reloads",
        )?;

        let policy_reload_error = Counter::new(
            "gateway_policy_reload_error",
            "Number of failed policy reloads",
        )?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "gateway_request_duration_seconds",
            "Duration of event submission requests in seconds",
        ))?;

        registry.register(Box::new(admission_decisions.clone()))?;
        registry.register(Box::new(auto_blocks.clone()))?;
        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(publish_attempts.clone()))?;
        registry.register(Box::new(publish_retries.clone()))?;
        registry.register(Box::new(policy_reload_success.clone()))?;
        registry.register(Box::new(policy_reload_error.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            admission_decisions,
            auto_blocks,
            events_published,
            publish_attempts,
            publish_retries,
            policy_reload_success,
            policy_reload_error,
            request_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admission(&self, route: &str, reason: &str) {
        self.admission_decisions
            .with_label_values(&[route, reason])
            .inc();
    }

    pub fn record_auto_block(&self) {
        self.auto_blocks.inc();
    }

    /// Record the final outcome of publishing one event
    pub fn record_event_published(&self, destination: &str, result: &str) {
        self.events_published
            .with_label_values(&[destination, result])
            .inc();
    }

    pub fn record_publish_attempt(&self, result: &str) {
        self.publish_attempts.with_label_values(&[result]).inc();
    }

    pub fn record_publish_retry(&self) {
        self.publish_retries.inc();
    }

    pub fn record_policy_reload_success(&self) {
        self.policy_reload_success.inc();
    }

    pub fn record_policy_reload_error(&self) {
        self.policy_reload_error.inc();
    }

    /// Create a timer for measuring request duration
    pub fn start_request_timer(&self) -> prometheus::HistogramTimer {
        self.request_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
