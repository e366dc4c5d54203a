use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    /// [`crate::error::BuildStage::as_str`].
    pub stage: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- builds --
    pub builds_total: Family<OutcomeLabels, Counter>,
    pub build_failures_total: Family<StageLabels, Counter>,
    pub build_duration_seconds: Histogram,
    pub static_deltas_total: Counter,

    // -- upload --
    pub upload_bytes: Counter,
    pub upload_objects: Counter,

    // -- gauges --
    pub active_builds: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let builds_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "edgeupdates_builds",
            "Finished update builds by outcome",
            builds_total.clone(),
        );

        let build_failures_total = Family::<StageLabels, Counter>::default();
        registry.register(
            "edgeupdates_build_failures",
            "Failed update builds by failing stage",
            build_failures_total.clone(),
        );

        let build_duration_seconds = Histogram::new(exponential_buckets(1.0, 2.0, 14));
        registry.register(
            "edgeupdates_build_duration_seconds",
            "Update build latency in seconds",
            build_duration_seconds.clone(),
        );

        let static_deltas_total = Counter::default();
        registry.register(
            "edgeupdates_static_deltas",
            "Static deltas generated",
            static_deltas_total.clone(),
        );

        let upload_bytes = Counter::default();
        registry.register(
            "edgeupdates_upload_bytes",
            "Total bytes written by repository uploads",
            upload_bytes.clone(),
        );

        let upload_objects = Counter::default();
        registry.register(
            "edgeupdates_upload_objects",
            "Total files written by repository uploads",
            upload_objects.clone(),
        );

        let active_builds: Gauge = Gauge::default();
        registry.register(
            "edgeupdates_active_builds",
            "Builds currently running",
            active_builds.clone(),
        );

        Self {
            builds_total,
            build_failures_total,
            build_duration_seconds,
            static_deltas_total,
            upload_bytes,
            upload_objects,
            active_builds,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::http::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all service metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// OpenMetrics text exposition.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        prometheus_client::encoding::text::encode(&mut body, &self.registry)?;
        Ok(body)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
