//! Error types for the device twin system
//!
//! Every failure the core can surface is one of these variants. Stale or
//! duplicate sync deliveries are not errors; see
//! [`ApplyOutcome`](crate::traits::ApplyOutcome).

use thiserror::Error;

/// Result type alias for devtwin operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the device twin system
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed device, model or visitor specification
    #[error("Configuration error: {0}")]
    Config(String),

    /// Raw bytes could not be turned into a property value
    #[error("Decode error: {0}")]
    Decode(String),

    /// A property value could not be turned into raw bytes, or the device rejected the write
    #[error("Encode error: {0}")]
    Encode(String),

    /// Delivery or reception failure reported by the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Sync store errors
    #[error("Sync store error: {0}")]
    SyncStore(String),

    /// Unknown device, property or model
    #[error("Not found: {0}")]
    NotFound(String),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error raised by an externally registered codec
    #[error("Codec error ({protocol}): {message}")]
    Codec {
        /// Protocol name the codec was registered under
        protocol: String,
        /// Error message
        message: String,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create an encode error
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a sync store error
    pub fn sync_store(msg: impl Into<String>) -> Self {
        Self::SyncStore(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an error on behalf of a custom protocol codec
    pub fn codec(protocol: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Codec {
            protocol: protocol.into(),
            message: message.into(),
        }
    }

    /// Fatal for the affected property: never retried.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Pauses the calling task until the transport reports it is alive again.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Counted against `collectRetryTimes`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::Encode(_) | Self::Codec { .. } | Self::Other(_)
        )
    }
}

/// Lets externally supplied codecs written against `anyhow` report failures
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::config("bad visitor").is_config());
        assert!(Error::transport("link down").is_transport());
        assert!(Error::decode("short buffer").is_retryable());
        assert!(Error::codec("acme", "nope").is_retryable());
        assert!(!Error::config("bad visitor").is_retryable());
        assert!(!Error::transport("link down").is_retryable());
        assert!(!Error::not_found("plc-9").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::codec("acme-serial", "checksum mismatch");
        assert_eq!(err.to_string(), "Codec error (acme-serial): checksum mismatch");
    }
}
