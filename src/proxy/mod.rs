//! Forwarding requests to backends.

mod body;
mod dispatcher;
mod forwarder;
mod headers;

pub use body::LeasedBody;
pub use dispatcher::{DispatchError, Dispatcher, Lease, Upstream};
pub use forwarder::{ForwardError, Forwarder, HttpForwarder, ProxyBody};
pub use headers::{append_forwarded_for, set_host, strip_hop_by_hop, X_FORWARDED_FOR};
