//! Error types for kubeproc
//!
//! Errors are split by who is responsible for them. Client errors come from
//! the caller's request and map to a 4xx response; everything else is a
//! system error whose details stay in the logs.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Message returned to callers for any system-side failure
pub const GENERIC_FAILURE_MESSAGE: &str = "job processing failed, see server logs for details";

/// Main error type for kubeproc operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error, propagated unmodified
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The caller's request violates deployment policy or is malformed
    #[error("invalid request{}: {message}", field_suffix(.field))]
    Client {
        /// Offending request field, if attributable to one
        field: Option<String>,
        /// Description naming the allowed values or pattern
        message: String,
    },

    /// No backing object exists for the identifier
    #[error("job not found: {job_id}")]
    NotFound {
        /// Identifier that was looked up
        job_id: String,
    },

    /// The backend reported a state this engine does not model
    #[error("unmodeled {kind} state: {value:?}")]
    UnmodeledState {
        /// Which backend field carried the value (e.g. "workflow phase")
        kind: String,
        /// The unrecognized value
        value: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Webhook delivery failed
    #[error("webhook delivery to {url} failed: {message}")]
    Webhook {
        /// Target URI
        url: String,
        /// Description of what failed
        message: String,
    },

    /// A local result artifact could not be handled
    #[error("artifact error for {path}: {message}")]
    Artifact {
        /// Path of the artifact
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "create_client", "dispatcher")
        context: String,
    },
}

impl Error {
    /// Create a client error without a field attribution
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client {
            field: None,
            message: msg.into(),
        }
    }

    /// Create a client error attributed to a request field
    pub fn client_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Client {
            field: Some(field.into()),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a job identifier
    pub fn not_found(job_id: impl Into<String>) -> Self {
        Self::NotFound {
            job_id: job_id.into(),
        }
    }

    /// Create an unmodeled-state error
    pub fn unmodeled(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self::UnmodeledState {
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a webhook delivery error
    pub fn webhook(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Webhook {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create an artifact error
    pub fn artifact(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Artifact {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the caller is responsible for this error
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Client { .. })
    }

    /// Whether this is the expected "no such job" outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// HTTP status code a host framework should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Client { .. } => 400,
            Error::NotFound { .. } => 404,
            _ => 500,
        }
    }

    /// Message safe to show to the caller.
    ///
    /// Client and not-found errors are specific; system errors are generic.
    pub fn user_message(&self) -> String {
        match self {
            Error::Client { .. } | Error::NotFound { .. } => self.to_string(),
            _ => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

fn field_suffix(field: &Option<String>) -> String {
    field
        .as_deref()
        .map(|f| format!(" [{}]", f))
        .unwrap_or_default()
}

/// Check whether a kube error is an API 404
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_names_field_and_pattern() {
        let err = Error::client_field("image", "image 'evil:1' not allowed, only 'eurodatacube/.*'");
        let msg = err.to_string();
        assert!(msg.contains("[image]"));
        assert!(msg.contains("eurodatacube/.*"));
        assert!(err.is_client_error());
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.user_message(), msg);
    }

    #[test]
    fn client_error_without_field() {
        let err = Error::client("run_on_fargate is not allowed");
        assert_eq!(
            err.to_string(),
            "invalid request: run_on_fargate is not allowed"
        );
    }

    #[test]
    fn not_found_is_expected_outcome() {
        let err = Error::not_found("abc");
        assert!(err.is_not_found());
        assert!(!err.is_client_error());
        assert_eq!(err.http_status(), 404);
        assert!(err.user_message().contains("abc"));
    }

    #[test]
    fn system_errors_do_not_leak_details() {
        let err = Error::unmodeled("workflow phase", "Skipped");
        assert_eq!(err.http_status(), 500);
        assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);
        assert!(err.to_string().contains("Skipped"));

        let err = Error::internal_with_context("dispatcher", "token cancelled");
        assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);
        assert!(err.to_string().contains("[dispatcher]"));
    }

    #[test]
    fn internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
    }

    #[test]
    fn serde_errors_convert() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
