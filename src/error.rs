//! Error types for the firehose pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while ingesting and dispatching firehose events.
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// CBOR decoding error.
    #[error("cbor decode error: {0}")]
    Cbor(#[from] minicbor::decode::Error),

    /// Wire frame was structurally invalid (bad header, unknown shape).
    #[error("invalid frame: {0}")]
    Frame(String),

    /// CAR block store could not be read.
    #[error("car error: {0}")]
    Car(String),

    /// The upstream sent an explicit error frame.
    #[error("upstream error frame: {code}: {message}")]
    ErrorFrame {
        /// Error code reported by the relay.
        code: String,
        /// Human-readable message, if any.
        message: String,
    },

    /// MongoDB driver error.
    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// BSON (de)serialization error.
    #[error("bson error: {0}")]
    Bson(#[from] mongodb::bson::de::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A coordination channel closed unexpectedly.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_frame_display() {
        let err = Error::ErrorFrame {
            code: "OutdatedCursor".to_string(),
            message: "cursor too old".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("OutdatedCursor"));
        assert!(msg.contains("cursor too old"));
    }

    #[test]
    fn config_error_display() {
        let err = Error::Config("missing DB_URI".to_string());
        assert!(err.to_string().contains("missing DB_URI"));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
