//! Error taxonomy shared by every stage of a synchronization cycle

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the synchronization engine
#[derive(Debug, Error)]
pub enum Error {
    /// A path could not be read while walking the tree. Fatal to the walk.
    #[error("Unreadable path {}: {source}", path.display())]
    IoUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The generation backend reported a failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// The generation backend did not answer within the configured timeout
    #[error("Backend timed out after {0:?}")]
    BackendTimeout(Duration),

    /// The backend answered with unusable markup
    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    /// No Clean diagram exists yet for the scope
    #[error("No diagram available yet for scope '{0}'")]
    NotYetAvailable(String),

    /// Storage and other plumbing failures
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error belongs to the backend family and may be retried
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Error::Backend(_) | Error::BackendTimeout(_) | Error::MalformedResponse(_)
        )
    }

    /// Short stable label, used in status output and persisted records
    pub fn kind(&self) -> &'static str {
        match self {
            Error::IoUnreadable { .. } => "io-unreadable",
            Error::Backend(_) => "backend-error",
            Error::BackendTimeout(_) => "backend-timeout",
            Error::MalformedResponse(_) => "malformed-response",
            Error::NotYetAvailable(_) => "not-yet-available",
            Error::Other(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_family() {
        assert!(Error::Backend("x".into()).is_backend());
        assert!(Error::BackendTimeout(Duration::from_secs(1)).is_backend());
        assert!(Error::MalformedResponse("empty".into()).is_backend());
        assert!(!Error::NotYetAvailable("src".into()).is_backend());
    }

    #[test]
    fn test_unreadable_message_names_path() {
        let err = Error::IoUnreadable {
            path: PathBuf::from("src/secret"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("src/secret"));
        assert_eq!(err.kind(), "io-unreadable");
    }
}
