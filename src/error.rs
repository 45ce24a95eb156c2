//! Error types for the SDK

use std::time::Duration;

/// Platform error codes meaning the access token itself was refused
const TOKEN_REJECTED_CODES: [i64; 3] = [40001, 40014, 42001];

/// SDK error type
#[derive(Debug, thiserror::Error)]
pub enum MpError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("WeChat API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Invalid request signature")]
    InvalidSignature,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Timed out after {0:?} waiting for the token refresh lock")]
    LockTimeout(Duration),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

impl MpError {
    /// True when the platform refused the access token (invalid or expired)
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, MpError::Api { code, .. } if TOKEN_REJECTED_CODES.contains(code))
    }
}

/// Result type for SDK operations
pub type Result<T> = std::result::Result<T, MpError>;
