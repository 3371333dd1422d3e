//! A single upstream server and its live state.

use crate::health::{next_status, ProbeOutcome, Transition};
use hyper::Uri;
use parking_lot::RwLock;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

/// Position of a backend in its registry. Stable for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(usize);

impl BackendId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Index of the backend in registry order.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness classification of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// Not probed yet.
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health-related fields that must be read and written together.
#[derive(Debug, Clone, Default)]
struct HealthRecord {
    status: HealthStatus,
    last_probe: Option<SystemTime>,
    last_error: Option<String>,
    /// Highest probe generation applied so far.
    generation: u64,
}

/// Outcome of recording a probe result against a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordResult {
    /// Applied; carries the transition when the status changed.
    Applied(Option<Transition>),
    /// Dropped because a newer generation was already recorded.
    Stale { current: u64 },
}

/// An upstream server.
///
/// Identity (`id`, base URL) is fixed at construction. Health is guarded by a
/// short-lived reader-writer lock; the load counter is a plain atomic so the
/// request path never waits on probe writers.
#[derive(Debug)]
pub struct Backend {
    id: BackendId,
    /// Normalized `scheme://authority/`.
    base: Uri,
    /// `scheme://authority`, used for logs and probe URLs.
    label: String,
    load: AtomicUsize,
    health: RwLock<HealthRecord>,
}

impl Backend {
    pub(crate) fn new(id: BackendId, base: Uri) -> Self {
        let label = base.to_string().trim_end_matches('/').to_string();
        Self {
            id,
            base,
            label,
            load: AtomicUsize::new(0),
            health: RwLock::new(HealthRecord::default()),
        }
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    /// Base URL (`scheme://host[:port]/`).
    pub fn url(&self) -> &Uri {
        &self.base
    }

    /// Base URL without the trailing slash.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn status(&self) -> HealthStatus {
        self.health.read().status
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// Current number of in-flight requests.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub fn increment_load(&self) {
        self.load.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the load counter, saturating at zero.
    ///
    /// Returns `false` if the counter was already zero, which means an
    /// unpaired release.
    pub fn decrement_load(&self) -> bool {
        self.load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Increment the load counter only if it still equals `expected`.
    pub(crate) fn try_claim(&self, expected: usize) -> bool {
        self.load
            .compare_exchange(expected, expected + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Build the outbound URI: this backend's scheme and authority with the
    /// path and query of `target`.
    pub fn rewrite_uri(&self, target: &Uri) -> Result<Uri, String> {
        let path_and_query = target
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut builder = Uri::builder().path_and_query(path_and_query);
        if let Some(scheme) = self.base.scheme_str() {
            builder = builder.scheme(scheme);
        }
        if let Some(authority) = self.base.authority() {
            builder = builder.authority(authority.as_str());
        }
        builder.build().map_err(|e| e.to_string())
    }

    /// URI probed by the health checker.
    pub fn probe_uri(&self, path: &str) -> Result<Uri, String> {
        format!("{}{}", self.label, path)
            .parse::<Uri>()
            .map_err(|e| e.to_string())
    }

    /// Point-in-time copy of this backend's state.
    pub fn snapshot(&self) -> BackendSnapshot {
        let health = self.health.read().clone();
        BackendSnapshot {
            id: self.id,
            url: self.base.clone(),
            status: health.status,
            load: self.load(),
            last_probe: health.last_probe,
            last_error: health.last_error,
        }
    }

    /// The single gate through which health changes.
    ///
    /// `generation` is `Some` for probe results; results older than the
    /// newest recorded generation are rejected. Manual marks pass `None`.
    pub(crate) fn record(&self, outcome: &ProbeOutcome, generation: Option<u64>) -> RecordResult {
        let mut health = self.health.write();

        if let Some(generation) = generation {
            if generation < health.generation {
                return RecordResult::Stale {
                    current: health.generation,
                };
            }
            health.generation = generation;
        }

        let from = health.status;
        let to = next_status(from, outcome);
        health.status = to;
        health.last_probe = Some(SystemTime::now());
        health.last_error = outcome.cause().map(str::to_string);

        let transition = (from != to).then(|| Transition {
            backend: self.id,
            url: self.label.clone(),
            from,
            to,
            cause: outcome.cause().map(str::to_string),
        });
        RecordResult::Applied(transition)
    }

    /// Copy status and probe metadata from a backend of a previous registry.
    pub(crate) fn inherit_health(&self, previous: &Backend) {
        let inherited = previous.health.read().clone();
        let mut health = self.health.write();
        health.status = inherited.status;
        health.last_probe = inherited.last_probe;
        health.last_error = inherited.last_error;
    }
}

/// Consistent copy of a backend's observable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSnapshot {
    pub id: BackendId,
    pub url: Uri,
    pub status: HealthStatus,
    pub load: usize,
    pub last_probe: Option<SystemTime>,
    pub last_error: Option<String>,
}

/// Holds one unit of a backend's load counter and releases it on drop.
///
/// Dropping happens on every exit path, including errors, cancellation of
/// the owning future, and unwinding panics, so increments and decrements stay
/// paired per request.
#[derive(Debug)]
pub struct LoadGuard {
    backend: Arc<Backend>,
}

impl LoadGuard {
    /// Increment the backend's load and return the guard for it.
    pub fn acquire(backend: Arc<Backend>) -> Self {
        backend.increment_load();
        Self { backend }
    }

    /// Wrap a load unit that the caller already added.
    pub(crate) fn claimed(backend: Arc<Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Deref for LoadGuard {
    type Target = Backend;

    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if !self.backend.decrement_load() {
            tracing::error!(backend = %self.backend.label, "load counter released below zero");
        }
    }
}

/// Parse and normalize a backend base URL.
///
/// The URL must be absolute, use `http` or `https`, and name a host. Any path
/// or query is discarded; only scheme and authority identify a backend.
pub fn parse_base_url(raw: &str) -> Result<Uri, String> {
    let uri = raw.trim().parse::<Uri>().map_err(|e| e.to_string())?;

    let scheme = uri.scheme_str().ok_or_else(|| "missing scheme".to_string())?;
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return Err(format!("unsupported scheme '{}'", scheme));
    }

    let authority = uri.authority().ok_or_else(|| "missing host".to_string())?;
    if authority.host().is_empty() {
        return Err("missing host".to_string());
    }

    Uri::builder()
        .scheme(scheme.to_ascii_lowercase().as_str())
        .authority(authority.as_str())
        .path_and_query("/")
        .build()
        .map_err(|e| e.to_string())
}
