//! Active health probing.
//!
//! One long-lived task ticks at a fixed interval. Every tick starts a new
//! cycle: the cycle counter is bumped, and one check task per backend is
//! spawned into a `JoinSet`. Results are applied as they arrive, so a slow
//! backend never holds up the others. If the next tick comes while tasks from
//! the previous cycle are still running, those tasks are aborted and anything
//! they still deliver is discarded by generation.

use crate::backend::{Backend, BackendId, BackendRegistry, RecordResult};
use crate::health::{LivenessCheck, ProbeError, ProbeOutcome};
use crate::metrics::{EventSink, LbEvent};
use crate::state::RegistryHandle;
use crate::util::ShutdownSignal;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Shortest interval the loop runs at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Timing of the probe loop.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    /// Time between the starts of two cycles.
    pub interval: Duration,
    /// Budget for one check.
    pub timeout: Duration,
}

/// Returned when the probe loop did not drain before the stop deadline.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("health probe did not stop within {0:?}, in-flight checks abandoned")]
pub struct StopTimeout(pub Duration);

/// Counters shared between the loop, its check tasks, and the handle.
#[derive(Debug, Default)]
struct ProbeStats {
    in_flight: AtomicUsize,
    generation: AtomicU64,
}

/// Counts a check task as in flight until dropped.
///
/// Lives inside the task's future, so it is released whether the task
/// finishes or is aborted.
struct InFlight(Arc<ProbeStats>);

impl InFlight {
    fn enter(stats: &Arc<ProbeStats>) -> Self {
        stats.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(stats))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// What a check task hands back to the loop.
struct ProbeReport {
    registry: Arc<BackendRegistry>,
    backend: BackendId,
    url: String,
    generation: u64,
    result: Result<(), ProbeError>,
    latency: Duration,
}

/// The probe loop, before it is started.
pub struct HealthProbe {
    registry: RegistryHandle,
    checker: Arc<dyn LivenessCheck>,
    settings: ProbeSettings,
    events: Arc<dyn EventSink>,
}

impl HealthProbe {
    pub fn new(
        registry: RegistryHandle,
        checker: Arc<dyn LivenessCheck>,
        mut settings: ProbeSettings,
        events: Arc<dyn EventSink>,
    ) -> Self {
        if settings.interval < MIN_INTERVAL {
            warn!(
                requested = ?settings.interval,
                used = ?MIN_INTERVAL,
                "probe interval too short, clamping"
            );
            settings.interval = MIN_INTERVAL;
        }
        Self {
            registry,
            checker,
            settings,
            events,
        }
    }

    /// Start the loop on the current runtime.
    pub fn spawn(self) -> ProbeHandle {
        let shutdown = ShutdownSignal::new();
        let stats = Arc::new(ProbeStats::default());
        let (finished_tx, finished_rx) = watch::channel(false);

        let task = tokio::spawn(self.run(shutdown.clone(), Arc::clone(&stats), finished_tx));

        ProbeHandle {
            shutdown,
            stats,
            finished: finished_rx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(
        self,
        shutdown: ShutdownSignal,
        stats: Arc<ProbeStats>,
        finished: watch::Sender<bool>,
    ) {
        info!(
            interval = ?self.settings.interval,
            timeout = ?self.settings.timeout,
            "health probe starting"
        );

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cycle: JoinSet<ProbeReport> = JoinSet::new();
        let mut generation = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = ticker.tick() => {
                    if !cycle.is_empty() {
                        cycle.abort_all();
                        self.events.emit(&LbEvent::ProbeCycleSuperseded {
                            generation,
                            abandoned: cycle.len(),
                        });
                    }

                    generation += 1;
                    stats.generation.store(generation, Ordering::Release);

                    let registry = self.registry.load();
                    for backend in registry.backends() {
                        self.spawn_check(
                            &mut cycle,
                            &registry,
                            backend,
                            generation,
                            &shutdown,
                            &stats,
                        );
                    }
                }

                Some(joined) = cycle.join_next(), if !cycle.is_empty() => {
                    self.apply(joined, generation);
                }
            }
        }

        // Check tasks also watch the signal, so most have already returned.
        cycle.abort_all();
        while cycle.join_next().await.is_some() {}

        info!(generation, "health probe stopped");
        finished.send_replace(true);
    }

    fn spawn_check(
        &self,
        cycle: &mut JoinSet<ProbeReport>,
        registry: &Arc<BackendRegistry>,
        backend: &Arc<Backend>,
        generation: u64,
        shutdown: &ShutdownSignal,
        stats: &Arc<ProbeStats>,
    ) {
        let in_flight = InFlight::enter(stats);
        let check = self.checker.check(Arc::clone(backend));
        let registry = Arc::clone(registry);
        let backend_id = backend.id();
        let url = backend.label().to_string();
        let timeout = self.settings.timeout;
        let shutdown = shutdown.clone();

        cycle.spawn(async move {
            let _in_flight = in_flight;
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(ProbeError::Cancelled),
                checked = tokio::time::timeout(timeout, check) => {
                    checked.unwrap_or(Err(ProbeError::Timeout(timeout)))
                }
            };

            ProbeReport {
                registry,
                backend: backend_id,
                url,
                generation,
                result,
                latency: started.elapsed(),
            }
        });
    }

    fn apply(&self, joined: Result<ProbeReport, JoinError>, current: u64) {
        let report = match joined {
            Ok(report) => report,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                error!(error = %e, "health check task panicked");
                return;
            }
        };

        if report.generation != current {
            debug!(
                url = %report.url,
                generation = report.generation,
                current,
                "discarding result from superseded probe cycle"
            );
            return;
        }

        let outcome = match report.result {
            Ok(()) => ProbeOutcome::Healthy,
            // Shutting down says nothing about the backend.
            Err(ProbeError::Cancelled) => return,
            Err(e) => ProbeOutcome::unhealthy(e.to_string()),
        };

        match report.registry.record_probe(report.backend, report.generation, &outcome) {
            Some(RecordResult::Applied(transition)) => {
                self.events.emit(&LbEvent::ProbeCompleted {
                    backend: report.backend,
                    url: report.url,
                    generation: report.generation,
                    outcome,
                    latency: report.latency,
                });
                if let Some(transition) = transition {
                    self.events.emit(&LbEvent::HealthTransition(transition));
                }
            }
            Some(RecordResult::Stale { current }) => {
                debug!(
                    url = %report.url,
                    current,
                    "backend already holds a newer probe result"
                );
            }
            None => {}
        }
    }
}

/// Control handle for a running probe loop.
pub struct ProbeHandle {
    shutdown: ShutdownSignal,
    stats: Arc<ProbeStats>,
    finished: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProbeHandle {
    /// Check tasks currently alive.
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::Acquire)
    }

    /// Generation of the most recently started cycle; 0 before the first.
    pub fn generation(&self) -> u64 {
        self.stats.generation.load(Ordering::Acquire)
    }

    /// Whether the loop has exited and drained its checks.
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Stop the loop and wait for in-flight checks, at most `deadline`.
    ///
    /// No new cycle starts once this is called. Running checks are told to
    /// cancel and are awaited; if that takes longer than `deadline` the loop
    /// task is aborted and the remaining checks are abandoned. Calling this
    /// again, or concurrently, is harmless.
    pub async fn stop(&self, deadline: Duration) -> Result<(), StopTimeout> {
        self.shutdown.shutdown();

        let mut finished = self.finished.clone();
        let drained = tokio::time::timeout(deadline, finished.wait_for(|done| *done)).await;

        let task = self.task.lock().take();
        match drained {
            Ok(_) => {
                if let Some(task) = task {
                    let _ = task.await;
                }
                Ok(())
            }
            Err(_) => {
                if let Some(task) = task {
                    task.abort();
                }
                Err(StopTimeout(deadline))
            }
        }
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HealthStatus;
    use crate::metrics::MemorySink;
    use futures::future::BoxFuture;
    use futures::FutureExt;

    type Scripting = (Duration, Result<(), ProbeError>);
    type Behavior = dyn Fn(&Backend, usize) -> Scripting + Send + Sync;

    /// Check whose delay and result are scripted per backend and call number.
    struct Scripted {
        calls: Mutex<Vec<usize>>,
        behavior: Box<Behavior>,
    }

    impl Scripted {
        fn new(
            backends: usize,
            behavior: impl Fn(&Backend, usize) -> Scripting + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(vec![0; backends]),
                behavior: Box::new(behavior),
            })
        }

        fn calls(&self, index: usize) -> usize {
            self.calls.lock()[index]
        }
    }

    impl LivenessCheck for Scripted {
        fn check(&self, backend: Arc<Backend>) -> BoxFuture<'static, Result<(), ProbeError>> {
            let n = {
                let mut calls = self.calls.lock();
                let slot = &mut calls[backend.id().index()];
                let n = *slot;
                *slot += 1;
                n
            };
            let (delay, result) = (self.behavior)(&backend, n);
            async move {
                tokio::time::sleep(delay).await;
                result
            }
            .boxed()
        }
    }

    fn handle(addresses: &[&str]) -> RegistryHandle {
        RegistryHandle::new(BackendRegistry::new(addresses.iter().copied()).unwrap())
    }

    fn settings(interval_ms: u64, timeout_ms: u64) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn start(
        registry: &RegistryHandle,
        checker: Arc<Scripted>,
        settings: ProbeSettings,
        events: Arc<MemorySink>,
    ) -> ProbeHandle {
        HealthProbe::new(registry.clone(), checker, settings, events).spawn()
    }

    fn statuses(registry: &RegistryHandle) -> Vec<HealthStatus> {
        registry.load().snapshot().iter().map(|s| s.status).collect()
    }

    const ABC: [&str; 3] = ["http://10.0.0.1", "http://10.0.0.2", "http://10.0.0.3"];

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_classifies_every_backend() {
        let registry = handle(&ABC);
        let checker = Scripted::new(3, |b, _| {
            let result = if b.id().index() == 1 {
                Err(ProbeError::Status(500))
            } else {
                Ok(())
            };
            (Duration::from_millis(10), result)
        });
        let events = Arc::new(MemorySink::new());

        let probe = start(&registry, checker, settings(1000, 200), events.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            statuses(&registry),
            vec![HealthStatus::Healthy, HealthStatus::Unhealthy, HealthStatus::Healthy]
        );
        let transitions = events.transitions();
        assert_eq!(transitions.len(), 3);
        assert!(transitions.iter().all(|t| t.from == HealthStatus::Unknown));
        let failed = transitions
            .iter()
            .find(|t| t.backend == BackendId::new(1))
            .unwrap();
        assert_eq!(failed.cause.as_deref(), Some("unexpected status 500"));

        probe.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_then_one_success() {
        let registry = handle(&ABC);
        // Backend 0 fails only on its second probe.
        let checker = Scripted::new(3, |b, n| {
            let result = if b.id().index() == 0 && n == 1 {
                Err(ProbeError::Request("connection refused".into()))
            } else {
                Ok(())
            };
            (Duration::from_millis(5), result)
        });
        let probe = start(&registry, checker, settings(100, 50), Arc::default());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(statuses(&registry)[0], HealthStatus::Healthy);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = &registry.load().snapshot()[0];
        assert_eq!(snap.status, HealthStatus::Unhealthy);
        assert_eq!(snap.last_error.as_deref(), Some("request failed: connection refused"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(statuses(&registry)[0], HealthStatus::Healthy);

        probe.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_check_times_out_without_delaying_others() {
        let registry = handle(&ABC);
        let checker = Scripted::new(3, |b, _| {
            if b.id().index() == 2 {
                (Duration::from_secs(3600), Ok(()))
            } else {
                (Duration::from_millis(1), Ok(()))
            }
        });
        let probe = start(&registry, checker, settings(1000, 300), Arc::default());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            statuses(&registry),
            vec![HealthStatus::Healthy, HealthStatus::Healthy, HealthStatus::Unknown]
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        let snap = &registry.load().snapshot()[2];
        assert_eq!(snap.status, HealthStatus::Unhealthy);
        assert!(snap.last_error.as_deref().unwrap().starts_with("timed out"));

        probe.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_cycle_is_abandoned() {
        let registry = handle(&ABC[..1]);
        // First probe is slow and would report failure; later probes are quick.
        let checker = Scripted::new(1, |_, n| {
            if n == 0 {
                (Duration::from_millis(250), Err(ProbeError::Status(503)))
            } else {
                (Duration::from_millis(5), Ok(()))
            }
        });
        let events = Arc::new(MemorySink::new());
        let probe = start(&registry, checker.clone(), settings(100, 1000), events.clone());

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(statuses(&registry), vec![HealthStatus::Healthy]);
        assert!(checker.calls(0) >= 4);
        assert_eq!(
            events.count(|e| matches!(
                e,
                LbEvent::ProbeCycleSuperseded {
                    generation: 1,
                    abandoned: 1
                }
            )),
            1
        );
        // The abandoned generation-1 result never reached the registry.
        assert!(events.transitions().iter().all(|t| t.to == HealthStatus::Healthy));

        probe.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_cycle_drains_all_checks() {
        let registry = handle(&ABC);
        let checker = Scripted::new(3, |_, _| (Duration::from_secs(3600), Ok(())));
        let probe = start(&registry, checker, settings(10_000, 10_000), Arc::default());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probe.generation(), 1);
        assert_eq!(probe.in_flight(), 3);

        let started = Instant::now();
        probe.stop(Duration::from_millis(500)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        assert!(probe.is_finished());
        assert_eq!(probe.in_flight(), 0);
        // Cancellation is not a failure.
        assert_eq!(statuses(&registry), vec![HealthStatus::Unknown; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let registry = handle(&ABC);
        let checker = Scripted::new(3, |_, _| (Duration::from_millis(1), Ok(())));
        let probe = start(&registry, checker, settings(100, 50), Arc::default());

        tokio::time::sleep(Duration::from_millis(5)).await;

        let (a, b) = tokio::join!(
            probe.stop(Duration::from_secs(1)),
            probe.stop(Duration::from_secs(1))
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert!(probe.stop(Duration::from_secs(1)).await.is_ok());

        let generation = probe.generation();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probe.generation(), generation, "no cycle may start after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_follows_registry_swap() {
        let registry = handle(&ABC[..1]);
        let checker = Scripted::new(4, |_, _| (Duration::from_millis(1), Ok(())));
        let probe = start(&registry, checker.clone(), settings(100, 50), Arc::default());

        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.swap(BackendRegistry::new(["http://10.0.0.8", "http://10.0.0.9"]).unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(statuses(&registry), vec![HealthStatus::Healthy; 2]);

        probe.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let registry = handle(&ABC[..1]);
        let checker = Scripted::new(1, |_, _| (Duration::ZERO, Ok(())));
        let probe = start(&registry, checker, settings(0, 50), Arc::default());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(probe.generation() > 1);
        assert_eq!(statuses(&registry), vec![HealthStatus::Healthy]);

        probe.stop(Duration::from_secs(1)).await.unwrap();
    }
}
