//! Backend pool state and selection algorithms.

pub mod algorithms;
mod registry;
mod server;

pub use registry::BackendRegistry;
pub use server::{
    parse_base_url, Backend, BackendId, BackendSnapshot, HealthStatus, LoadGuard, RecordResult,
};
