//! Health checking for backend servers.

mod checker;
mod probe;
mod state;

pub use checker::{HttpChecker, LivenessCheck, ProbeError};
pub use probe::{HealthProbe, ProbeHandle, ProbeSettings, StopTimeout};
pub use state::{next_status, ProbeOutcome, Transition};
