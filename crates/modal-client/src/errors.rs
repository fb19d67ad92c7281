//! Errors returned when talking to the Modal backend

use thiserror::Error;

/// Failures surfaced by the backend client.
///
/// Reconcilers key their retry and condition-reporting policy off these
/// variants, so the distinction between a backend that cannot be reached
/// and a resource that does not exist matters.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached, timed out, or answered with a
    /// server-side error. Retryable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The referenced remote resource does not exist. Benign on delete and
    /// status paths.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Remote resource kind ("app", "function", ...)
        kind: &'static str,
        /// The identifier that failed to resolve
        id: String,
    },

    /// Credential material was missing or unreadable. Fatal at process
    /// start; treated as `Unavailable` if it happens mid-rotation.
    #[error("credentials: {0}")]
    Credentials(String),

    /// The backend answered with a shape this client does not understand.
    #[error("unexpected backend response: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Whether a bounded retry within the same reconcile pass is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }

    /// Whether the error means the remote resource is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(code) if code == reqwest::StatusCode::NOT_FOUND => BackendError::NotFound {
                kind: "resource",
                id: e
                    .url()
                    .map(|u| u.path().to_owned())
                    .unwrap_or_else(|| "<unknown>".to_owned()),
            },
            Some(code) if code.is_client_error() => BackendError::Protocol(e.to_string()),
            _ => BackendError::Unavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryability_follows_variant() {
        assert!(BackendError::Unavailable("connection reset".into()).is_retryable());
        assert!(!BackendError::Protocol("bad json".into()).is_retryable());
        assert!(!BackendError::NotFound {
            kind: "app",
            id: "ap-123".into()
        }
        .is_retryable());
    }

    #[test]
    fn not_found_detection() {
        let err = BackendError::NotFound {
            kind: "app",
            id: "ap-123".into(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "app ap-123 not found");
    }
}
