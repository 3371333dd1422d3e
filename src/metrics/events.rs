//! Structured events emitted by the balancer core.
//!
//! The core never logs or counts directly; it emits [`LbEvent`]s into an
//! [`EventSink`]. Sinks decide what to do with them.

use crate::backend::{BackendId, HealthStatus};
use crate::health::{ProbeOutcome, Transition};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Something observable happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LbEvent {
    /// A backend changed health status.
    HealthTransition(Transition),
    /// A liveness check finished and was applied.
    ProbeCompleted {
        backend: BackendId,
        url: String,
        generation: u64,
        outcome: ProbeOutcome,
        latency: Duration,
    },
    /// A probe cycle was still running when the next one started.
    ProbeCycleSuperseded { generation: u64, abandoned: usize },
    /// No healthy backend was available for a request.
    SelectionExhausted {
        strategy: &'static str,
        pool_size: usize,
    },
    /// A new backend registry was swapped in.
    Reconfigured { backends: usize },
}

/// Receiver of balancer events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LbEvent);
}

/// Writes every event as a structured `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &LbEvent) {
        match event {
            LbEvent::HealthTransition(t) if t.to == HealthStatus::Healthy => {
                info!(
                    backend = %t.backend,
                    url = %t.url,
                    from = %t.from,
                    to = %t.to,
                    "backend is healthy"
                );
            }
            LbEvent::HealthTransition(t) => {
                warn!(
                    backend = %t.backend,
                    url = %t.url,
                    from = %t.from,
                    to = %t.to,
                    cause = t.cause.as_deref().unwrap_or(""),
                    "backend left rotation"
                );
            }
            LbEvent::ProbeCompleted {
                backend,
                url,
                generation,
                outcome,
                latency,
            } => {
                debug!(
                    backend = %backend,
                    url = %url,
                    generation,
                    healthy = outcome.is_healthy(),
                    cause = outcome.cause().unwrap_or(""),
                    latency_ms = latency.as_millis() as u64,
                    "probe completed"
                );
            }
            LbEvent::ProbeCycleSuperseded {
                generation,
                abandoned,
            } => {
                warn!(
                    generation,
                    abandoned,
                    "probe cycle overran its interval, abandoning stragglers"
                );
            }
            LbEvent::SelectionExhausted {
                strategy,
                pool_size,
            } => {
                warn!(strategy, pool_size, "no healthy backend available");
            }
            LbEvent::Reconfigured { backends } => {
                info!(backends, "backend pool replaced");
            }
        }
    }
}

/// Fans events out to several sinks.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that only logs.
    pub fn tracing() -> Self {
        Self::new().with_sink(Arc::new(TracingSink))
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &LbEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Keeps events in memory. Handy for embedding and for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LbEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LbEvent> {
        self.events.lock().clone()
    }

    /// Health transitions recorded so far, in order.
    pub fn transitions(&self) -> Vec<Transition> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LbEvent::HealthTransition(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&LbEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &LbEvent) {
        self.events.lock().push(event.clone());
    }
}
