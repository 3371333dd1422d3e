//! Least-connections selection.

use super::{SelectionExhausted, SelectionStrategy};
use crate::backend::{Backend, LoadGuard};
use std::sync::Arc;
use tracing::trace;

/// Compare-and-claim attempts before settling for a plain increment.
const MAX_CLAIM_ATTEMPTS: usize = 16;

/// Sends each request to the healthy backend with the fewest in-flight
/// requests. Ties go to the backend listed first.
///
/// Claiming is a compare-and-swap on the chosen backend's load, retried with
/// a fresh scan if another request got there first. Two concurrent requests
/// therefore never both take the same idle backend while another idle one is
/// available.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }

    /// Index and observed load of the least-loaded healthy backend.
    fn scan(pool: &[Arc<Backend>]) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for (i, backend) in pool.iter().enumerate() {
            if !backend.is_healthy() {
                continue;
            }
            let load = backend.load();
            match best {
                Some((_, min)) if load >= min => {}
                _ => best = Some((i, load)),
            }
        }
        best
    }
}

impl SelectionStrategy for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn pick(&self, pool: &[Arc<Backend>]) -> Option<usize> {
        Self::scan(pool).map(|(i, _)| i)
    }

    fn claim(&self, pool: &[Arc<Backend>]) -> Result<LoadGuard, SelectionExhausted> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let (index, load) = Self::scan(pool).ok_or(SelectionExhausted)?;
            let backend = &pool[index];
            if backend.try_claim(load) {
                return Ok(LoadGuard::claimed(Arc::clone(backend)));
            }
        }

        trace!("least-connections claim contended, taking current minimum");
        let index = self.pick(pool).ok_or(SelectionExhausted)?;
        Ok(LoadGuard::acquire(Arc::clone(&pool[index])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendId, BackendRegistry};
    use std::time::Duration;

    fn registry(n: usize) -> Arc<BackendRegistry> {
        let addresses: Vec<String> = (1..=n).map(|i| format!("http://10.0.0.{}", i)).collect();
        let registry = BackendRegistry::new(addresses).unwrap();
        for i in 0..n {
            registry.mark_healthy(BackendId::new(i));
        }
        Arc::new(registry)
    }

    #[test]
    fn test_least_conn_selects_lowest() {
        let registry = registry(3);
        let lc = LeastConnections::new();

        registry.increment_load(BackendId::new(0));
        registry.increment_load(BackendId::new(0));
        registry.increment_load(BackendId::new(1));

        assert_eq!(lc.pick(registry.backends()), Some(2));
    }

    #[test]
    fn test_least_conn_ties_go_to_first() {
        let registry = registry(3);
        let lc = LeastConnections::new();
        assert_eq!(lc.pick(registry.backends()), Some(0));

        registry.increment_load(BackendId::new(0));
        assert_eq!(lc.pick(registry.backends()), Some(1));
    }

    #[test]
    fn test_least_conn_skips_unhealthy() {
        let registry = registry(3);
        let lc = LeastConnections::new();

        registry.mark_unhealthy(BackendId::new(0), "down");
        registry.increment_load(BackendId::new(1));

        assert_eq!(lc.pick(registry.backends()), Some(2));

        registry.mark_unhealthy(BackendId::new(1), "down");
        registry.mark_unhealthy(BackendId::new(2), "down");
        assert_eq!(lc.pick(registry.backends()), None);
        assert_eq!(lc.claim(registry.backends()).unwrap_err(), SelectionExhausted);
    }

    #[test]
    fn test_least_conn_empty() {
        let lc = LeastConnections::new();
        assert!(lc.pick(&[]).is_none());
        assert!(lc.claim(&[]).is_err());
    }

    #[test]
    fn test_sequential_release_stays_on_first() {
        let registry = registry(3);
        let lc = LeastConnections::new();

        // Released before the next claim, so every backend is idle each time.
        let mut counts = [0usize; 3];
        for _ in 0..900 {
            let guard = lc.claim(registry.backends()).unwrap();
            counts[guard.id().index()] += 1;
        }
        assert_eq!(counts, [900, 0, 0]);
        assert!(registry.backends().iter().all(|b| b.load() == 0));
    }

    #[tokio::test]
    async fn test_overlapping_requests_spread_evenly() {
        let registry = registry(3);
        let lc = Arc::new(LeastConnections::new());
        let mut tasks = tokio::task::JoinSet::new();

        // Every claim happens before the first release.
        for _ in 0..900 {
            let registry = Arc::clone(&registry);
            let lc = Arc::clone(&lc);
            tasks.spawn(async move {
                let guard = lc.claim(registry.backends()).unwrap();
                let id = guard.id();
                tokio::time::sleep(Duration::from_millis(1)).await;
                drop(guard);
                id.index()
            });
        }

        let mut counts = [0usize; 3];
        while let Some(index) = tasks.join_next().await {
            counts[index.unwrap()] += 1;
        }

        for count in counts {
            assert!(count.abs_diff(300) <= 5, "counts {:?}", counts);
        }
        assert!(registry.backends().iter().all(|b| b.load() == 0));
    }

    #[test]
    fn test_concurrent_claims_stay_balanced() {
        let registry = registry(4);
        let lc = Arc::new(LeastConnections::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let lc = Arc::clone(&lc);
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| lc.claim(registry.backends()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let guards: Vec<LoadGuard> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let loads: Vec<usize> = registry.backends().iter().map(|b| b.load()).collect();
        assert_eq!(loads.iter().sum::<usize>(), 1000);
        let spread = loads.iter().max().unwrap() - loads.iter().min().unwrap();
        assert!(spread <= 1, "loads {:?}", loads);

        drop(guards);
        assert!(registry.backends().iter().all(|b| b.load() == 0));
    }
}
