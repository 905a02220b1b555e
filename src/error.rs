//! Error types for mail-reply-smith.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }

    pub(crate) fn missing(key: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            key: key.into(),
            hint: hint.into(),
        }
    }
}

/// Failures reported by the inbound or outbound mail transports.
///
/// The split between `Transient` and `Permanent` drives the dispatcher's
/// retry policy: only transient failures (and timeouts) are retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("{transport} transient failure: {reason}")]
    Transient { transport: String, reason: String },

    #[error("{transport} rejected the request: {reason}")]
    Permanent { transport: String, reason: String },

    #[error("{transport} call timed out after {timeout:?}")]
    Timeout { transport: String, timeout: Duration },
}

impl TransportError {
    pub fn transient(transport: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            transport: transport.into(),
            reason: reason.into(),
        }
    }

    pub fn permanent(transport: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            transport: transport.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

/// Pipeline-level errors surfaced to the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Fetch from folder {folder} failed: {source}")]
    Fetch {
        folder: String,
        #[source]
        source: TransportError,
    },

    #[error("Giving up after {failures} consecutive fetch failures; last: {last_error}")]
    FetchEscalated { failures: u32, last_error: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_count_as_transient() {
        let err = TransportError::Timeout {
            transport: "smtp".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(err.is_transient());
        assert!(TransportError::transient("imap", "connection reset").is_transient());
        assert!(!TransportError::permanent("smtp", "550 no such user").is_transient());
    }

    #[test]
    fn escalation_message_names_failure_count() {
        let err = PipelineError::FetchEscalated {
            failures: 3,
            last_error: "imap transient failure: refused".into(),
        };
        assert!(err.to_string().contains("3 consecutive"));
    }
}
