//! Metrics collector using prometheus-client.
//!
//! Turns balancer events into counters and gauges, and records per-request
//! metrics on behalf of the frontend.

use crate::backend::HealthStatus;
use crate::metrics::{EventSink, LbEvent};
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Labels for request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub backend: String,
    pub method: String,
    pub status: String,
}

/// Labels for per-backend metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

/// Labels for health transitions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub backend: String,
    pub to: String,
}

/// Labels for probe metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    pub backend: String,
    pub result: ProbeResult,
}

/// Result of a liveness check.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ProbeResult {
    Success,
    Failure,
}

/// Labels for selection metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StrategyLabels {
    pub strategy: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<BackendLabels, Histogram>,
    active_connections: Gauge,
    /// 1 = healthy, 0 = unhealthy or not yet probed.
    backend_health: Family<BackendLabels, Gauge>,
    health_transitions_total: Family<TransitionLabels, Counter>,
    probes_total: Family<ProbeLabels, Counter>,
    probe_duration_seconds: Family<BackendLabels, Histogram>,
    probe_cycles_superseded_total: Counter,
    selection_exhausted_total: Family<StrategyLabels, Counter>,
    backends: Gauge,
    registry: Registry,
}

fn latency_histogram() -> Histogram {
    // 1ms .. ~10s
    Histogram::new(exponential_buckets(0.001, 2.5, 11))
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        let request_duration_seconds = Family::<BackendLabels, Histogram>::new_with_constructor(
            latency_histogram as fn() -> Histogram,
        );
        let active_connections = Gauge::default();
        let backend_health = Family::<BackendLabels, Gauge>::default();
        let health_transitions_total = Family::<TransitionLabels, Counter>::default();
        let probes_total = Family::<ProbeLabels, Counter>::default();
        let probe_duration_seconds = Family::<BackendLabels, Histogram>::new_with_constructor(
            latency_histogram as fn() -> Histogram,
        );
        let probe_cycles_superseded_total = Counter::default();
        let selection_exhausted_total = Family::<StrategyLabels, Counter>::default();
        let backends = Gauge::default();

        registry.register(
            "glb_requests",
            "Total number of requests processed",
            requests_total.clone(),
        );
        registry.register(
            "glb_request_duration_seconds",
            "Request duration in seconds",
            request_duration_seconds.clone(),
        );
        registry.register(
            "glb_active_connections",
            "Number of open client connections",
            active_connections.clone(),
        );
        registry.register(
            "glb_backend_health",
            "Backend health status (1=healthy, 0=otherwise)",
            backend_health.clone(),
        );
        registry.register(
            "glb_health_transitions",
            "Backend health status changes",
            health_transitions_total.clone(),
        );
        registry.register(
            "glb_probes",
            "Liveness checks applied",
            probes_total.clone(),
        );
        registry.register(
            "glb_probe_duration_seconds",
            "Liveness check duration in seconds",
            probe_duration_seconds.clone(),
        );
        registry.register(
            "glb_probe_cycles_superseded",
            "Probe cycles abandoned because the next one started",
            probe_cycles_superseded_total.clone(),
        );
        registry.register(
            "glb_selection_exhausted",
            "Requests rejected because no backend was healthy",
            selection_exhausted_total.clone(),
        );
        registry.register(
            "glb_backends",
            "Number of configured backends",
            backends.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                requests_total,
                request_duration_seconds,
                active_connections,
                backend_health,
                health_transitions_total,
                probes_total,
                probe_duration_seconds,
                probe_cycles_superseded_total,
                selection_exhausted_total,
                backends,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.inner.registry)?;
        Ok(buffer)
    }

    /// Record a completed request. `backend` is empty when none was selected.
    pub fn record_request(&self, backend: &str, method: &str, status: u16, duration: Duration) {
        let backend = if backend.is_empty() { "none" } else { backend };
        let labels = RequestLabels {
            backend: backend.to_string(),
            method: method.to_string(),
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();
        self.inner
            .request_duration_seconds
            .get_or_create(&BackendLabels {
                backend: backend.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    pub fn connection_opened(&self) {
        self.inner.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.inner.active_connections.dec();
    }

    /// Start timing a request.
    pub fn start_request_timer(&self) -> RequestTimer {
        RequestTimer {
            collector: self.clone(),
            start: Instant::now(),
        }
    }

    fn set_backend_health(&self, backend: &str, status: HealthStatus) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner
            .backend_health
            .get_or_create(&labels)
            .set(i64::from(status == HealthStatus::Healthy));
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MetricsCollector {
    fn emit(&self, event: &LbEvent) {
        match event {
            LbEvent::HealthTransition(t) => {
                self.inner
                    .health_transitions_total
                    .get_or_create(&TransitionLabels {
                        backend: t.url.clone(),
                        to: t.to.as_str().to_string(),
                    })
                    .inc();
                self.set_backend_health(&t.url, t.to);
            }
            LbEvent::ProbeCompleted {
                url,
                outcome,
                latency,
                ..
            } => {
                let result = if outcome.is_healthy() {
                    ProbeResult::Success
                } else {
                    ProbeResult::Failure
                };
                self.inner
                    .probes_total
                    .get_or_create(&ProbeLabels {
                        backend: url.clone(),
                        result,
                    })
                    .inc();
                self.inner
                    .probe_duration_seconds
                    .get_or_create(&BackendLabels { backend: url.clone() })
                    .observe(latency.as_secs_f64());
            }
            LbEvent::ProbeCycleSuperseded { .. } => {
                self.inner.probe_cycles_superseded_total.inc();
            }
            LbEvent::SelectionExhausted { strategy, .. } => {
                self.inner
                    .selection_exhausted_total
                    .get_or_create(&StrategyLabels {
                        strategy: strategy.to_string(),
                    })
                    .inc();
            }
            LbEvent::Reconfigured { backends } => {
                self.inner.backends.set(*backends as i64);
            }
        }
    }
}

/// Measures one request from creation until [`record`](Self::record).
pub struct RequestTimer {
    collector: MetricsCollector,
    start: Instant,
}

impl RequestTimer {
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the request and consume the timer.
    pub fn record(self, backend: &str, method: &str, status: u16) {
        let duration = self.start.elapsed();
        self.collector.record_request(backend, method, status, duration);
    }
}
