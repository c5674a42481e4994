use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag attached to every log entry produced by a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    PermissionDenied,
    CapabilityUnsupported,
    TransportFailure,
    ToolExecutionFailure,
    /// Not a failure: a start refused because the manager locked the assistant.
    MaintenanceBlocked,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::PermissionDenied => "permission-denied",
            ErrorCategory::CapabilityUnsupported => "capability-unsupported",
            ErrorCategory::TransportFailure => "transport-failure",
            ErrorCategory::ToolExecutionFailure => "tool-execution-failure",
            ErrorCategory::MaintenanceBlocked => "maintenance-blocked",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("live capability not available: {0}")]
    CapabilityUnsupported(String),

    #[error("live transport failure: {0}")]
    TransportFailure(String),

    #[error("audio device failure: {0}")]
    AudioDevice(String),

    #[error("tool execution failed: {0}")]
    ToolExecutionFailure(String),
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::PermissionDenied(_) => ErrorCategory::PermissionDenied,
            SessionError::CapabilityUnsupported(_) => ErrorCategory::CapabilityUnsupported,
            SessionError::TransportFailure(_) | SessionError::AudioDevice(_) => {
                ErrorCategory::TransportFailure
            }
            SessionError::ToolExecutionFailure(_) => ErrorCategory::ToolExecutionFailure,
        }
    }

    /// Sorts a remote error message into the capability or generic transport bucket.
    pub fn from_remote(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if ["implemented", "supported", "enabled"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            SessionError::CapabilityUnsupported(message)
        } else {
            SessionError::TransportFailure(message)
        }
    }
}

/// Errors raised while acquiring or running the microphone.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("no capture device: {0}")]
    NoDevice(String),

    #[error("capture stream failed: {0}")]
    Stream(String),
}

impl CaptureError {
    /// Maps a backend error description, recognising refused access.
    pub fn from_backend(description: impl Into<String>) -> Self {
        let description = description.into();
        let lower = description.to_lowercase();
        if ["permission", "denied", "not allowed", "notallowed", "unauthorized"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            CaptureError::PermissionDenied(description)
        } else {
            CaptureError::Stream(description)
        }
    }
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(msg) => SessionError::PermissionDenied(msg),
            CaptureError::NoDevice(msg) | CaptureError::Stream(msg) => {
                SessionError::AudioDevice(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_tags_match_serde_names() {
        for category in [
            ErrorCategory::PermissionDenied,
            ErrorCategory::CapabilityUnsupported,
            ErrorCategory::TransportFailure,
            ErrorCategory::ToolExecutionFailure,
            ErrorCategory::MaintenanceBlocked,
        ] {
            assert_eq!(
                serde_json::to_value(category).unwrap(),
                serde_json::Value::from(category.as_str())
            );
        }
    }

    #[test]
    fn test_remote_errors_are_categorized() {
        let err = SessionError::from_remote("Live API is not enabled for this project");
        assert_eq!(err.category(), ErrorCategory::CapabilityUnsupported);

        let err = SessionError::from_remote("Method not implemented");
        assert_eq!(err.category(), ErrorCategory::CapabilityUnsupported);

        let err = SessionError::from_remote("Internal error encountered");
        assert_eq!(err.category(), ErrorCategory::TransportFailure);
    }

    #[test]
    fn test_capture_errors_map_to_permission_denied() {
        let err = CaptureError::from_backend("Access Denied by the OS privacy settings");
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        assert_eq!(
            SessionError::from(err).category(),
            ErrorCategory::PermissionDenied
        );

        let err = CaptureError::from_backend("device disconnected");
        assert!(matches!(err, CaptureError::Stream(_)));
        assert_eq!(
            SessionError::from(err).category(),
            ErrorCategory::TransportFailure
        );
    }
}
