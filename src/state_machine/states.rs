use serde::{Deserialize, Serialize};
use std::fmt;

/// Deployment lifecycle states.
///
/// Exactly one value at all times. `Stopped` and `Failed` are terminal for a
/// given incarnation; a stopped deployment can be redeployed and a failed one
/// resubmitted, both of which start a new incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Initial state when a deploy request is accepted
    Pending,
    /// Infrastructure is being provisioned
    Deploying,
    /// Deployment is serving traffic
    Running,
    /// Replica count change in progress
    Scaling,
    /// Image update in progress
    Updating,
    /// Teardown in progress
    Stopping,
    /// Stopped cleanly; can be redeployed
    Stopped,
    /// Initial deploy failed after retries were exhausted
    Failed,
    /// Post-running operation failed
    Error,
}

impl DeploymentStatus {
    /// Terminal for the current incarnation (no in-flight work expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// A transitional state with an operation expected to be in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Deploying | Self::Scaling | Self::Updating | Self::Stopping
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn can_be_stopped(&self) -> bool {
        matches!(self, Self::Running | Self::Error)
    }

    pub fn can_be_scaled(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn can_be_updated(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn can_be_restarted(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl Default for DeploymentStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Deploying => write!(f, "deploying"),
            Self::Running => write!(f, "running"),
            Self::Scaling => write!(f, "scaling"),
            Self::Updating => write!(f, "updating"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "deploying" => Ok(Self::Deploying),
            "running" => Ok(Self::Running),
            "scaling" => Ok(Self::Scaling),
            "updating" => Ok(Self::Updating),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid deployment status: {s}")),
        }
    }
}

/// Operational health, tracked independently of lifecycle status.
///
/// A `Running` deployment can be `Degraded` or `Unknown` without changing
/// its lifecycle state; monitor-side connectivity loss only ever moves
/// health to `Unknown`, never the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// All desired replicas ready
    Healthy,
    /// Some but not all desired replicas ready
    Degraded,
    /// Recovery attempts exhausted
    Unhealthy,
    /// No observation available (backend unreachable or never polled)
    Unknown,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for HealthState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "unhealthy" => Ok(Self::Unhealthy),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid health state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(DeploymentStatus::Stopped.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(!DeploymentStatus::Running.is_terminal());
        assert!(!DeploymentStatus::Error.is_terminal());
        assert!(!DeploymentStatus::Pending.is_terminal());
    }

    #[test]
    fn test_transitional_states() {
        for status in [
            DeploymentStatus::Pending,
            DeploymentStatus::Deploying,
            DeploymentStatus::Scaling,
            DeploymentStatus::Updating,
            DeploymentStatus::Stopping,
        ] {
            assert!(status.is_transitional());
        }
        assert!(!DeploymentStatus::Running.is_transitional());
        assert!(!DeploymentStatus::Stopped.is_transitional());
    }

    #[test]
    fn test_capability_checks() {
        assert!(DeploymentStatus::Running.can_be_scaled());
        assert!(!DeploymentStatus::Scaling.can_be_scaled());
        assert!(DeploymentStatus::Running.can_be_stopped());
        assert!(DeploymentStatus::Error.can_be_stopped());
        assert!(!DeploymentStatus::Stopped.can_be_stopped());
        assert!(DeploymentStatus::Stopped.can_be_restarted());
        assert!(DeploymentStatus::Failed.can_be_restarted());
    }

    #[test]
    fn test_status_string_conversion() {
        assert_eq!(DeploymentStatus::Deploying.to_string(), "deploying");
        assert_eq!(
            "running".parse::<DeploymentStatus>().unwrap(),
            DeploymentStatus::Running
        );
        assert!("bogus".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn test_health_string_conversion() {
        assert_eq!(HealthState::Degraded.to_string(), "degraded");
        assert_eq!(
            "unknown".parse::<HealthState>().unwrap(),
            HealthState::Unknown
        );
    }

    #[test]
    fn test_status_serde() {
        let status = DeploymentStatus::Deploying;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"deploying\"");

        let parsed: DeploymentStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }
}
