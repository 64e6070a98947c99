//! Error types for scholar-core.

use thiserror::Error;

/// Result type for scholar-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in scholar-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The kernel process could not be launched or never reported readiness.
    #[error("kernel startup failed: {0}")]
    EngineStartup(String),

    /// Communication with a running kernel broke down (process died, pipe closed).
    #[error("kernel channel error: {0}")]
    Channel(String),

    /// A kernel message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The coordination hint store is unreachable or returned garbage.
    #[error("coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means the kernel is gone and must be restarted.
    pub fn is_fatal_to_kernel(&self) -> bool {
        matches!(self, Self::Channel(_) | Self::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::CoordinationUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Channel("pipe closed".into()).is_fatal_to_kernel());
        assert!(!Error::Protocol("bad json".into()).is_fatal_to_kernel());
        assert!(!Error::EngineStartup("no python".into()).is_fatal_to_kernel());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::EngineStartup("kernel did not become ready".into());
        assert_eq!(
            err.to_string(),
            "kernel startup failed: kernel did not become ready"
        );
        let err = Error::CoordinationUnavailable("connection refused".into());
        assert_eq!(
            err.to_string(),
            "coordination store unavailable: connection refused"
        );
    }
}
