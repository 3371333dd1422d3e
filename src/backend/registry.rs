//! The backend pool.

use crate::backend::server::{parse_base_url, Backend, BackendId, BackendSnapshot, RecordResult};
use crate::config::ConfigError;
use crate::health::{ProbeOutcome, Transition};
use std::collections::HashMap;
use std::sync::Arc;

/// Ordered, fixed set of backends and their live state.
///
/// The order is the order of the configured address list and never changes;
/// strategies use it for deterministic tie-breaks. The set itself is never
/// mutated after construction: reconfiguration builds a new registry.
#[derive(Debug)]
pub struct BackendRegistry {
    backends: Vec<Arc<Backend>>,
}

impl BackendRegistry {
    /// Build a registry from base URLs.
    ///
    /// Fails without building anything if the list is empty or any entry is
    /// not an absolute http(s) URL with a host. Every backend starts
    /// `Unknown` with zero load.
    pub fn new<I, S>(addresses: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let backends = addresses
            .into_iter()
            .enumerate()
            .map(|(index, address)| {
                let address = address.as_ref();
                parse_base_url(address)
                    .map(|url| Arc::new(Backend::new(BackendId::new(index), url)))
                    .map_err(|reason| ConfigError::InvalidAddress {
                        address: address.to_string(),
                        reason,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if backends.is_empty() {
            return Err(ConfigError::EmptyBackends);
        }

        Ok(Self { backends })
    }

    /// Number of backends. Always at least one.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// All backends in registry order, regardless of health.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn get(&self, id: BackendId) -> Option<&Arc<Backend>> {
        self.backends.get(id.index())
    }

    /// Find a backend by its normalized base URL.
    pub fn find(&self, url: &str) -> Option<&Arc<Backend>> {
        let wanted = parse_base_url(url).ok()?;
        self.backends.iter().find(|b| *b.url() == wanted)
    }

    /// Ordered copy of every backend's state.
    ///
    /// Each entry is read under that backend's own lock, so status, error and
    /// probe time always belong together; the call never waits on more than
    /// one brief writer at a time.
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        self.backends.iter().map(|b| b.snapshot()).collect()
    }

    /// Backends currently eligible for selection, in registry order.
    pub fn healthy(&self) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect()
    }

    /// Mark a backend healthy. Idempotent; unknown ids are ignored.
    pub fn mark_healthy(&self, id: BackendId) -> Option<Transition> {
        self.apply(id, &ProbeOutcome::Healthy, None)
    }

    /// Mark a backend unhealthy with a cause. Idempotent; unknown ids are ignored.
    pub fn mark_unhealthy(&self, id: BackendId, cause: impl Into<String>) -> Option<Transition> {
        self.apply(id, &ProbeOutcome::unhealthy(cause), None)
    }

    /// Record a probe result tagged with its cycle generation.
    ///
    /// Returns `None` for unknown ids.
    pub fn record_probe(
        &self,
        id: BackendId,
        generation: u64,
        outcome: &ProbeOutcome,
    ) -> Option<RecordResult> {
        self.get(id).map(|b| b.record(outcome, Some(generation)))
    }

    pub fn increment_load(&self, id: BackendId) {
        if let Some(b) = self.get(id) {
            b.increment_load();
        }
    }

    /// Returns `false` for unknown ids or a counter already at zero.
    pub fn decrement_load(&self, id: BackendId) -> bool {
        self.get(id).is_some_and(|b| b.decrement_load())
    }

    /// Carry health state over from the registry this one replaces.
    ///
    /// Backends are matched by base URL. Load counters are not copied: requests
    /// still in flight release against the registry they were issued from.
    pub fn inherit_health(&self, previous: &BackendRegistry) {
        let by_url: HashMap<_, _> = previous
            .backends
            .iter()
            .map(|b| (b.url().clone(), b))
            .collect();

        for backend in &self.backends {
            if let Some(old) = by_url.get(backend.url()) {
                backend.inherit_health(old);
            }
        }
    }

    fn apply(
        &self,
        id: BackendId,
        outcome: &ProbeOutcome,
        generation: Option<u64>,
    ) -> Option<Transition> {
        match self.get(id)?.record(outcome, generation) {
            RecordResult::Applied(transition) => transition,
            RecordResult::Stale { .. } => None,
        }
    }
}
