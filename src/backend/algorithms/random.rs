//! Uniform random selection among healthy backends.

use super::SelectionStrategy;
use crate::backend::Backend;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Picks uniformly at random among the healthy backends.
///
/// The generator is seeded once and shared behind a lock; picks are cheap
/// enough that contention on it does not matter.
#[derive(Debug)]
pub struct Random {
    rng: Mutex<StdRng>,
}

impl Random {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sequence, for tests and benchmarks.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn pick(&self, pool: &[Arc<Backend>]) -> Option<usize> {
        let healthy: Vec<usize> = pool
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_healthy())
            .map(|(i, _)| i)
            .collect();

        if healthy.is_empty() {
            return None;
        }

        let n = self.rng.lock().gen_range(0..healthy.len());
        Some(healthy[n])
    }
}
