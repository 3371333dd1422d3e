//! Backend selection strategies.

mod least_conn;
mod random;

pub use least_conn::LeastConnections;
pub use random::Random;

use crate::backend::{Backend, LoadGuard};
use crate::config::Strategy;
use std::sync::Arc;
use thiserror::Error;

/// No backend in the pool is healthy.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("no healthy backend available")]
pub struct SelectionExhausted;

/// Policy for choosing a backend for one request.
///
/// Strategies see the whole pool in registry order and must skip backends
/// that are not healthy themselves.
pub trait SelectionStrategy: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Index into `pool` of the chosen backend, or `None` if none is healthy.
    fn pick(&self, pool: &[Arc<Backend>]) -> Option<usize>;

    /// Choose a backend and count the request against it.
    ///
    /// The returned guard holds one unit of load until dropped.
    fn claim(&self, pool: &[Arc<Backend>]) -> Result<LoadGuard, SelectionExhausted> {
        let index = self.pick(pool).ok_or(SelectionExhausted)?;
        Ok(LoadGuard::acquire(Arc::clone(&pool[index])))
    }
}

/// Build the strategy named in configuration.
pub fn build_strategy(strategy: Strategy) -> Arc<dyn SelectionStrategy> {
    match strategy {
        Strategy::LeastConnections => Arc::new(LeastConnections::new()),
        Strategy::Random => Arc::new(Random::new()),
    }
}
