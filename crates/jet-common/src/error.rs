//! Error types for the jet-core pipeline.

use thiserror::Error;

/// Result type alias using JetError.
pub type JetResult<T> = Result<T, JetError>;

/// Primary error type for pipeline operations.
#[derive(Debug, Error)]
pub enum JetError {
    // === Request Errors ===
    #[error("request '{request}' is missing required keys: {missing:?}")]
    MissingKeys {
        request: String,
        missing: Vec<String>,
    },

    #[error("invalid value '{value}' for key '{key}': {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },

    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("configuration error: {0}")]
    Config(String),

    // === Data Errors ===
    #[error("bad data field request: {0}")]
    BadDataFieldRequest(String),

    #[error("data not available: {0}")]
    DataUnavailable(String),

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    // === Cache Errors ===
    #[error("memory limit of {limit_kb} kB exceeded storing {key} ({size_kb} kB, {usage_kb} kB in use)")]
    MemoryLimitExceeded {
        key: String,
        size_kb: usize,
        usage_kb: usize,
        limit_kb: usize,
    },

    #[error("item is not active in the cache: {0}")]
    NotActive(String),

    // === Pipeline Errors ===
    #[error("pipeline wiring error: {0}")]
    Wiring(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl JetError {
    /// Create a MissingKeys error.
    pub fn missing_keys(request: impl Into<String>, missing: Vec<String>) -> Self {
        Self::MissingKeys {
            request: request.into(),
            missing,
        }
    }

    /// Create an InvalidValue error.
    pub fn invalid_value(
        key: impl Into<String>,
        value: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.into(),
            message: message.into(),
        }
    }

    /// Create a BadDataFieldRequest error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadDataFieldRequest(msg.into())
    }

    /// Create a DataUnavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::DataUnavailable(msg.into())
    }

    /// Create a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a Wiring error.
    pub fn wiring(msg: impl Into<String>) -> Self {
        Self::Wiring(msg.into())
    }

    /// True for errors caused by the caller's request rather than the data.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            JetError::MissingKeys { .. }
                | JetError::InvalidValue { .. }
                | JetError::UnknownOperator(_)
                | JetError::Config(_)
        )
    }
}

impl From<std::io::Error> for JetError {
    fn from(err: std::io::Error) -> Self {
        JetError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for JetError {
    fn from(err: serde_json::Error) -> Self {
        JetError::Io(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_message() {
        let err = JetError::missing_keys("MEMBER=0;", vec!["VARIABLE".to_string()]);
        assert!(err.to_string().contains("VARIABLE"));
        assert!(err.is_request_error());
    }

    #[test]
    fn test_data_errors_are_not_request_errors() {
        assert!(!JetError::unavailable("no grid").is_request_error());
        assert!(!JetError::bad_request("unknown variable").is_request_error());
    }
}
