//! glb - a health-aware HTTP load balancer
//!
//! Requests are spread over an ordered pool of backends by a selection
//! strategy (random or least connections). A background probe checks every
//! backend on a fixed interval and only healthy backends receive traffic.
//!
//! - [`backend`]: the registry of backends and the selection strategies
//! - [`health`]: liveness checks and the probe loop
//! - [`proxy`]: per-request dispatch and forwarding
//! - [`frontend`]: the client-facing listener
//! - [`config`]: YAML configuration and hot reload
//! - [`metrics`]: events, Prometheus metrics

pub mod backend;
pub mod config;
pub mod frontend;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod state;
pub mod util;

pub use config::Config;
pub use state::{LbState, RegistryHandle};
