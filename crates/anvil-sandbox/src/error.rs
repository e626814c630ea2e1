//! Error types for the verification engine.
//!
//! Only contract violations surface as `Err`. Everything that can go wrong
//! while verifying candidate code is reported as data in a
//! [`VerificationResult`](crate::result::VerificationResult).

/// Errors produced by the sandbox layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid security policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to start async runtime: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for SandboxError {
    fn from(err: reqwest::Error) -> Self {
        SandboxError::Http(err.to_string())
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
