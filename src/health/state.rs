//! Probe outcomes and the health transition rule.

use crate::backend::{BackendId, HealthStatus};

/// Result of a single liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy { cause: String },
}

impl ProbeOutcome {
    pub fn unhealthy(cause: impl Into<String>) -> Self {
        ProbeOutcome::Unhealthy {
            cause: cause.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            ProbeOutcome::Healthy => None,
            ProbeOutcome::Unhealthy { cause } => Some(cause),
        }
    }
}

/// A change of a backend's health status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub backend: BackendId,
    pub url: String,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub cause: Option<String>,
}

/// Status a backend moves to after `outcome`.
///
/// Every health write goes through this function. One failure is enough to
/// leave rotation and one success is enough to rejoin it; a threshold or
/// hysteresis policy belongs here and nowhere else.
pub fn next_status(_current: HealthStatus, outcome: &ProbeOutcome) -> HealthStatus {
    match outcome {
        ProbeOutcome::Healthy => HealthStatus::Healthy,
        ProbeOutcome::Unhealthy { .. } => HealthStatus::Unhealthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_result_decides() {
        let down = ProbeOutcome::unhealthy("timeout");
        for current in [HealthStatus::Unknown, HealthStatus::Healthy, HealthStatus::Unhealthy] {
            assert_eq!(next_status(current, &ProbeOutcome::Healthy), HealthStatus::Healthy);
            assert_eq!(next_status(current, &down), HealthStatus::Unhealthy);
        }
    }

    #[test]
    fn test_outcome_accessors() {
        assert!(ProbeOutcome::Healthy.is_healthy());
        assert_eq!(ProbeOutcome::Healthy.cause(), None);

        let down = ProbeOutcome::unhealthy("status 500");
        assert!(!down.is_healthy());
        assert_eq!(down.cause(), Some("status 500"));
    }
}
