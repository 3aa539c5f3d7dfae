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

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Transport {
    Ssh,
    Http,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum OperationKind {
    AdvertiseRefs,
    UploadPack,
    ReceivePack,
    UploadArchive,
    Archive,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Completed,
    NotFound,
    Unauthorized,
    BadRequest,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub transport: Transport,
    pub operation: OperationKind,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransportLabels {
    pub transport: Transport,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FetchOutcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    pub outcome: FetchOutcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum View {
    Index,
    Summary,
    Refs,
    Log,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Lookup {
    Hit,
    Miss,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub view: View,
    pub lookup: Lookup,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the server.
pub struct Metrics {
    // -- protocol --
    pub requests_total: Family<RequestLabels, Counter>,
    pub request_duration_seconds: Family<TransportLabels, Histogram>,
    pub active_sessions: Family<TransportLabels, Gauge>,

    // -- mirroring --
    pub mirror_fetch_total: Family<FetchLabels, Counter>,
    pub mirror_pass_duration_seconds: Histogram,
    pub mirror_repos: Gauge,

    // -- views --
    pub cache_lookups_total: Family<CacheLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "repohost_requests_total",
            "Protocol requests by transport, operation and outcome",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<TransportLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 14))
            });
        registry.register(
            "repohost_request_duration_seconds",
            "Protocol request latency in seconds",
            request_duration_seconds.clone(),
        );

        let active_sessions = Family::<TransportLabels, Gauge>::default();
        registry.register(
            "repohost_active_sessions",
            "Protocol requests currently being served",
            active_sessions.clone(),
        );

        let mirror_fetch_total = Family::<FetchLabels, Counter>::default();
        registry.register(
            "repohost_mirror_fetch_total",
            "Mirror fetches by outcome",
            mirror_fetch_total.clone(),
        );

        let mirror_pass_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 12));
        registry.register(
            "repohost_mirror_pass_duration_seconds",
            "Duration of one mirror reconciliation pass",
            mirror_pass_duration_seconds.clone(),
        );

        let mirror_repos: Gauge = Gauge::default();
        registry.register(
            "repohost_mirror_repos",
            "Mirror repositories found by the last pass",
            mirror_repos.clone(),
        );

        let cache_lookups_total = Family::<CacheLabels, Counter>::default();
        registry.register(
            "repohost_cache_lookups_total",
            "Derived view cache lookups by view and result",
            cache_lookups_total.clone(),
        );

        Self {
            requests_total,
            request_duration_seconds,
            active_sessions,
            mirror_fetch_total,
            mirror_pass_duration_seconds,
            mirror_repos,
            cache_lookups_total,
        }
    }

    pub fn record_lookup(&self, view: View, hit: bool) {
        let lookup = if hit { Lookup::Hit } else { Lookup::Miss };
        self.cache_lookups_total
            .get_or_create(&CacheLabels { view, lookup })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`](crate::AppState).
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_counter_is_encoded_with_labels() {
        let registry = MetricsRegistry::new();
        registry
            .metrics
            .requests_total
            .get_or_create(&RequestLabels {
                transport: Transport::Http,
                operation: OperationKind::UploadPack,
                outcome: Outcome::Completed,
            })
            .inc();
        registry.metrics.record_lookup(View::Index, true);

        let text = registry.encode().unwrap();
        assert!(text.contains("repohost_requests_total"));
        assert!(text.contains("transport=\"Http\""));
        assert!(text.contains("operation=\"UploadPack\""));
        assert!(text.contains("lookup=\"Hit\""));
    }
}
