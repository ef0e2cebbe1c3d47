//! Error types for the wire protocol

/// Result type alias using protocol Error
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding signal messages
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Message could not be encoded for the wire
    #[error("Encode error: {0}")]
    Encode(String),

    /// Inbound frame could not be decoded into a known message
    #[error("Decode error: {0}")]
    Decode(String),
}
