//! Error types for the session engine and its components

/// Result type alias using engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in signaling, transport and engine operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The server rejected the connection (bad token, permissions, ...)
    #[error("Connection not allowed: {0}")]
    NotAllowed(String),

    /// The server could not be reached at all
    #[error("Server unreachable: {0}")]
    ServerUnreachable(String),

    /// The server asked us to leave during a connection attempt
    #[error("Leave requested: {0}")]
    LeaveRequested(String),

    /// A bounded wait was cancelled through its cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A bounded wait ran out of time
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Operation attempted against a torn-down engine or coordinator.
    /// Always fatal, never retried.
    #[error("Unrecoverable state: {0}")]
    UnrecoverableState(String),

    /// SDP negotiation failed. Recoverable, but escalates the next
    /// reconnect attempt to the full restart path.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Signaling channel error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// WebRTC stack error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether a reconnect attempt failing with this error may be retried.
    ///
    /// Only an unrecoverable-state error stops the retry loop; everything
    /// else feeds back into the backoff policy.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::UnrecoverableState(_))
    }

    /// Whether this failure means the endpoint itself was unreachable,
    /// which makes it a candidate for initial-join retry and multi-region
    /// failover.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::ServerUnreachable(_))
    }

    /// Whether the next reconnect attempt must take the full restart path
    /// instead of the cheap resume.
    pub fn escalates_to_restart(&self) -> bool {
        matches!(self, Error::Negotiation(_))
    }
}

impl From<roomlink_core::ProtocolError> for Error {
    fn from(err: roomlink_core::ProtocolError) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Timeout("join".to_string());
        assert_eq!(err.to_string(), "Operation timeout: join");
    }

    #[test]
    fn test_unrecoverable_state_is_fatal() {
        assert!(!Error::UnrecoverableState("closed".to_string()).is_recoverable());
        assert!(Error::ServerUnreachable("refused".to_string()).is_recoverable());
        assert!(Error::Negotiation("no answer".to_string()).is_recoverable());
        assert!(Error::Timeout("transports".to_string()).is_recoverable());
    }

    #[test]
    fn test_negotiation_escalates_to_restart() {
        assert!(Error::Negotiation("no answer".to_string()).escalates_to_restart());
        assert!(!Error::Timeout("transports".to_string()).escalates_to_restart());
    }

    #[test]
    fn test_unreachable_classification() {
        assert!(Error::ServerUnreachable("refused".to_string()).is_unreachable());
        assert!(!Error::NotAllowed("bad token".to_string()).is_unreachable());
    }
}
