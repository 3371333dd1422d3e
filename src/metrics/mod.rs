//! Balancer events, metrics collection, and exposition.

mod collector;
mod events;
mod server;

pub use collector::{MetricsCollector, RequestTimer};
pub use events::{EventBus, EventSink, LbEvent, MemorySink, TracingSink};
pub use server::MetricsServer;
