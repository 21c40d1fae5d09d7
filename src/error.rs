use thiserror::Error;

/// Unified error type for the hopchain router
#[derive(Error, Debug)]
pub enum HopError {
    // Node specification errors
    #[error("Invalid node spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid auth token: {0}")]
    InvalidAuth(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Interface error: {0}")]
    Interface(String),

    // TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    // Chain/dial errors
    #[error("No nodes available")]
    NoNodesAvailable,

    #[error("Chain exhausted after {attempts} attempts")]
    ChainExhausted { attempts: u32 },

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Operation timed out")]
    Timeout,

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    // Name resolution errors
    #[error("Resolve failed for {0}")]
    Resolve(String),

    // Capability shims without a compiled-in byte mover
    #[error("{0} backend unavailable")]
    BackendUnavailable(&'static str),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Parse errors
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for hopchain operations
pub type Result<T> = std::result::Result<T, HopError>;

impl HopError {
    /// Check whether the error indicates a per-attempt dial failure that
    /// the chain retry loop may recover from.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HopError::ConnectFailed(_)
                | HopError::HandshakeFailed(_)
                | HopError::Timeout
                | HopError::Io(_)
                | HopError::NoNodesAvailable
        )
    }
}

impl From<rustls::Error> for HopError {
    fn from(err: rustls::Error) -> Self {
        HopError::Tls(err.to_string())
    }
}

impl From<tokio_socks::Error> for HopError {
    fn from(err: tokio_socks::Error) -> Self {
        HopError::ConnectFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(HopError::ConnectFailed("refused".to_string()).is_retryable());
        assert!(HopError::Timeout.is_retryable());
        assert!(HopError::NoNodesAvailable.is_retryable());

        assert!(!HopError::InvalidSpec("bad".to_string()).is_retryable());
        assert!(!HopError::BackendUnavailable("kcp").is_retryable());
        assert!(!HopError::AuthenticationFailed.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = HopError::ChainExhausted { attempts: 3 };
        assert_eq!(err.to_string(), "Chain exhausted after 3 attempts");

        let err = HopError::BackendUnavailable("kcp");
        assert_eq!(err.to_string(), "kcp backend unavailable");
    }
}
