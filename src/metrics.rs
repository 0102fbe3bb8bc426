use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

/// Prometheus instrumentation for the engine and both backends.
///
/// A handful of named collectors registered into a shared `Registry` at construction time,
/// covering child launches, connectivity messages, reachable-child count, and reconcile
/// latency.
#[derive(Clone)]
pub struct Metrics {
    pub child_launches: IntCounterVec,
    pub connectivity_messages: IntCounterVec,
    pub reachable_children: IntGauge,
    pub reconcile_latency: Histogram,
    pub readiness_probe_attempts: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            child_launches: IntCounterVec::new(
                Opts::new("keppel_child_launches_total", "child launch attempts by backend and outcome"),
                &["backend", "outcome"],
            )
            .unwrap(),
            connectivity_messages: IntCounterVec::new(
                Opts::new(
                    "keppel_connectivity_messages_total",
                    "connectivity messages received by the engine, by kind",
                ),
                &["kind"],
            )
            .unwrap(),
            reachable_children: IntGauge::new(
                "keppel_reachable_children",
                "number of accounts with a currently-reachable child",
            )
            .unwrap(),
            reconcile_latency: Histogram::with_opts(HistogramOpts::new(
                "keppel_kubernetes_reconcile_latency_seconds",
                "latency of a single kubernetes backend reconcile pass",
            ))
            .unwrap(),
            readiness_probe_attempts: IntCounterVec::new(
                Opts::new(
                    "keppel_readiness_probe_attempts_total",
                    "readiness probe attempts issued by the local-processes backend",
                ),
                &["result"],
            )
            .unwrap(),
        }
    }

    pub fn register(self, registry: &Registry) -> prometheus::Result<Self> {
        registry.register(Box::new(self.child_launches.clone()))?;
        registry.register(Box::new(self.connectivity_messages.clone()))?;
        registry.register(Box::new(self.reachable_children.clone()))?;
        registry.register(Box::new(self.reconcile_latency.clone()))?;
        registry.register(Box::new(self.readiness_probe_attempts.clone()))?;
        Ok(self)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
