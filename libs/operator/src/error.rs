use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification for git clone failures. The reconcile loop maps each kind
/// to a distinct condition reason and status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitErrorKind {
    Auth,
    RepositoryNotFound,
    Other,
}

/// All errors possible to occur during reconciliation
#[derive(Error, Debug)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate
    #[error("KubeError: {0}: {1}")]
    KubeError(String, #[source] Box<kube::Error>),

    /// Error from the finalizer helper wrapping a reconcile error
    #[error("FinalizerError: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    /// API group/resource discovery failed entirely
    #[error("DiscoveryError: {0}")]
    DiscoveryError(String),

    /// Auth secret missing, key missing or value empty
    #[error("AuthError: {0}")]
    AuthError(String),

    /// MCP rejected the request or returned a non-success envelope
    #[error("McpError: {0}")]
    McpError(String),

    /// Transport-level failure talking to MCP after retries were exhausted
    #[error("McpRequestError: {0}: {1}")]
    McpRequestError(String, #[source] Box<reqwest::Error>),

    /// Invalid user input in a CR spec
    #[error("ConfigError: {0}")]
    ConfigError(String),

    /// Git clone failed
    #[error("GitError: {message}")]
    GitError { kind: GitErrorKind, message: String },

    /// Sync schedule could not be parsed
    #[error("ScheduleError: {0}")]
    ScheduleError(String),

    /// JSON (de)serialization failed
    #[error("SerializationError: {0}: {1}")]
    SerializationError(String, #[source] Box<serde_json::Error>),

    /// A notification sink rejected the payload or was unreachable
    #[error("NotificationError: {0}")]
    NotificationError(String),

    /// Trace ID was requested outside an instrumented span
    #[error("invalid trace id")]
    InvalidTraceId,
}

impl Error {
    pub fn metric_label(&self) -> String {
        let label = match self {
            Error::KubeError(..) => "kube",
            Error::FinalizerError(..) => "finalizer",
            Error::DiscoveryError(..) => "discovery",
            Error::AuthError(..) => "auth",
            Error::McpError(..) => "mcp",
            Error::McpRequestError(..) => "mcp_request",
            Error::ConfigError(..) => "config",
            Error::GitError { .. } => "git",
            Error::ScheduleError(..) => "schedule",
            Error::SerializationError(..) => "serialization",
            Error::NotificationError(..) => "notification",
            Error::InvalidTraceId => "invalid_trace_id",
        };
        label.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_label_is_stable() {
        let e = Error::AuthError("secret not found".to_string());
        assert_eq!(e.metric_label(), "auth");
        let e = Error::GitError {
            kind: GitErrorKind::Auth,
            message: "401".to_string(),
        };
        assert_eq!(e.metric_label(), "git");
    }
}
