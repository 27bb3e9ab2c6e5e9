//! Error types for cache and request operations

use std::fmt;
use thiserror::Error;

/// Result type for cache and request operations
pub type ODataResult<T> = Result<T, ODataError>;

/// Text of the error a request receives when the batch stopped before it
pub const SKIPPED_MESSAGE: &str = "HTTP request was not processed because the previous request failed";

/// One entry of the `details` array of an OData error body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub target: Option<String>,
}

/// Main error type for cache and request operations.
///
/// The type is `Clone` because one response may be fanned out to several
/// waiters (deduplicated reads, merged PATCHes).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ODataError {
    /// Network failure or non-2xx response without a parseable OData error body
    #[error("HTTP request failed: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// OData `error` object returned by the service
    #[error("{message}")]
    Domain {
        status: u16,
        code: String,
        message: String,
        target: Option<String>,
        details: Vec<ErrorDetail>,
    },

    /// Request was not processed because another request of its batch failed
    #[error("{}", SKIPPED_MESSAGE)]
    Skipped { cause: Box<ODataError> },

    /// Operation was aborted on the client (transient row discarded, edit reset)
    #[error("Request canceled: {reason}")]
    Canceled { reason: String },

    /// Input rejected before any request was built
    #[error("Invalid {parameter}: {message}")]
    Validation { parameter: String, message: String },

    /// A property path could not be resolved against cached data
    #[error("Failed to drill-down into {path}, invalid segment: {segment}")]
    DrillDown { path: String, segment: String },

    /// Metadata lookup failed
    #[error("Metadata error: {message}")]
    Metadata { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ODataError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
        }
    }

    pub fn skipped(cause: ODataError) -> Self {
        Self::Skipped {
            cause: Box::new(cause),
        }
    }

    pub fn canceled(reason: impl Into<String>) -> Self {
        Self::Canceled {
            reason: reason.into(),
        }
    }

    pub fn validation(parameter: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Validation {
            parameter: parameter.into(),
            message: message.to_string(),
        }
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for client-side aborts; these are never logged or reported as failures
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// True for errors that describe the protocol rather than the business data
    pub fn is_technical(&self) -> bool {
        !matches!(self, Self::Validation { .. } | Self::Canceled { .. })
    }

    /// HTTP status of the failed response, if there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            Self::Domain { status, .. } => Some(*status),
            Self::Skipped { cause } => cause.status(),
            _ => None,
        }
    }

    /// The error that actually failed the batch, following `Skipped` chains
    pub fn root_cause(&self) -> &ODataError {
        match self {
            Self::Skipped { cause } => cause.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canceled_is_distinguishable() {
        let canceled = ODataError::canceled("transient row discarded");
        assert!(canceled.is_canceled());
        assert!(!canceled.is_technical());

        let failed = ODataError::transport(Some(500), "Internal Server Error");
        assert!(!failed.is_canceled());
        assert!(failed.is_technical());
    }

    #[test]
    fn test_skipped_keeps_root_cause() {
        let cause = ODataError::Domain {
            status: 400,
            code: "CODE".to_string(),
            message: "Value -1 not allowed".to_string(),
            target: None,
            details: Vec::new(),
        };
        let skipped = ODataError::skipped(cause.clone());

        assert_eq!(skipped.to_string(), SKIPPED_MESSAGE);
        assert_eq!(skipped.root_cause(), &cause);
        assert_eq!(skipped.status(), Some(400));
    }
}
