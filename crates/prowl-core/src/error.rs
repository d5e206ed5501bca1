use thiserror::Error;

/// Application-wide error types for prowl.
#[derive(Error, Debug)]
pub enum AppError {
    /// The site answered with a non-success status that is not a blocking signal.
    #[error("HTTP {status} for {url}")]
    HttpError { status: u16, url: String },

    /// The site refused the request (403/429): treated as a detection signal.
    #[error("Blocked with HTTP {status} for {url}")]
    Blocked { status: u16, url: String },

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A 2xx response whose body is empty or truncated.
    #[error("Malformed page at {url}: {reason}")]
    MalformedPage { url: String, reason: String },

    /// The page was delivered but its structure could not be parsed.
    #[error("Parse error at {url}: {reason}")]
    ParseError { url: String, reason: String },

    /// Session state store operation failed.
    #[error("Session store error: {0}")]
    StoreError(String),

    /// Listing output sink operation failed.
    #[error("Record sink error: {0}")]
    SinkError(String),

    /// A session record with this id already exists.
    #[error("Session '{0}' already exists and will not be resumed")]
    SessionConflict(String),

    /// Invalid configuration or invocation payload.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::MalformedPage { .. } => {
                true
            }
            AppError::HttpError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true for responses that indicate the crawler has been noticed.
    pub fn is_blocking(&self) -> bool {
        matches!(self, AppError::Blocked { .. })
    }

    /// Returns true if this error should count as a failure in the circuit breaker.
    ///
    /// Parse errors and definitive 4xx responses are not network signals.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::Blocked { .. }
            | AppError::MalformedPage { .. } => true,
            AppError::HttpError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> AppError {
        AppError::HttpError {
            status,
            url: "https://example.com/x".into(),
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(http(503).is_retryable());
        assert!(
            AppError::MalformedPage {
                url: "u".into(),
                reason: "empty body".into()
            }
            .is_retryable()
        );
        assert!(!http(404).is_retryable());
        assert!(
            !AppError::Blocked {
                status: 429,
                url: "u".into()
            }
            .is_retryable()
        );
        assert!(
            !AppError::ParseError {
                url: "u".into(),
                reason: "no fields".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(
            AppError::Blocked {
                status: 403,
                url: "u".into()
            }
            .should_trip_circuit()
        );
        assert!(AppError::Timeout(30).should_trip_circuit());
        assert!(http(500).should_trip_circuit());
        assert!(!http(404).should_trip_circuit());
        assert!(
            !AppError::ParseError {
                url: "u".into(),
                reason: "bad".into()
            }
            .should_trip_circuit()
        );
    }
}
