use serde::{Deserialize, Serialize};

/// Events that can trigger deployment state transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecycleEvent {
    /// Submit a pending deployment for provisioning
    Submit,
    /// The in-flight operation completed successfully
    Complete,
    /// The in-flight operation failed after retries were exhausted
    Fail(String),
    /// Change the replica count
    ScaleRequest,
    /// Replace the running image
    UpdateRequest,
    /// Stop the deployment
    StopRequest,
    /// Restart a stopped deployment
    StartRequest,
    /// Tear down and remove the deployment
    DeleteRequest,
    /// Reset a failed deployment back to pending for resubmission
    Retry,
}

impl LifecycleEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::ScaleRequest => "scale_request",
            Self::UpdateRequest => "update_request",
            Self::StopRequest => "stop_request",
            Self::StartRequest => "start_request",
            Self::DeleteRequest => "delete_request",
            Self::Retry => "retry",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Create a failure event with the given error message
    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings() {
        assert_eq!(LifecycleEvent::Submit.event_type(), "submit");
        assert_eq!(
            LifecycleEvent::fail_with_error("boom").event_type(),
            "fail"
        );
        assert_eq!(LifecycleEvent::DeleteRequest.event_type(), "delete_request");
    }

    #[test]
    fn test_error_message_extraction() {
        let event = LifecycleEvent::fail_with_error("backend unreachable");
        assert_eq!(event.error_message(), Some("backend unreachable"));
        assert_eq!(LifecycleEvent::Complete.error_message(), None);
    }
}
