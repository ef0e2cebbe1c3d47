//! Configuration types for the session engine

use std::time::Duration;

use roomlink_core::Encoding;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration for [`crate::SessionEngine`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Signaling channel options
    pub signal: SignalOptions,

    /// Media transport options
    pub rtc: RtcOptions,

    /// Extra attempts for the initial join when the server is unreachable
    /// (independent from post-join reconnection attempts)
    pub join_retries: u32,

    /// Bound on waiting for the media transports to reach connected
    pub transport_timeout: Duration,

    /// Bound on one publisher SDP round trip, separate from
    /// `transport_timeout`
    pub negotiation_timeout: Duration,

    /// Deadline for the server to acknowledge an `add_track` request
    pub publish_timeout: Duration,
}

/// Signaling channel options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalOptions {
    /// Subscribe to all published tracks automatically
    pub auto_subscribe: bool,

    /// Let the server adapt stream quality to visible size
    pub adaptive_stream: bool,

    /// Envelope encoding for outgoing frames
    #[serde(skip)]
    pub encoding: Encoding,

    /// Bound on the whole join handshake: socket connect plus the first
    /// inbound message
    pub connect_timeout: Duration,

    /// Network type hint forwarded to the server ("wifi", "cellular", ...)
    pub network_type: Option<String>,
}

/// Media transport options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RtcOptions {
    /// ICE servers to use instead of the ones handed out at join
    pub ice_servers: Vec<IceServerOverride>,

    /// Restrict ICE to relay candidates regardless of server configuration
    pub force_relay: bool,
}

/// Caller-supplied ICE server entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerOverride {
    /// STUN/TURN urls
    pub urls: Vec<String>,
    /// TURN username, empty for STUN
    pub username: String,
    /// TURN credential, empty for STUN
    pub credential: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            signal: SignalOptions::default(),
            rtc: RtcOptions::default(),
            join_retries: 3,
            transport_timeout: Duration::from_secs(15),
            negotiation_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            auto_subscribe: true,
            adaptive_stream: false,
            encoding: Encoding::Binary,
            connect_timeout: Duration::from_secs(15),
            network_type: None,
        }
    }
}

impl EngineOptions {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if any timeout is zero or `join_retries` is
    /// unreasonably large.
    pub fn validate(&self) -> Result<()> {
        if self.signal.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "connect_timeout must be non-zero".to_string(),
            ));
        }

        if self.transport_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "transport_timeout must be non-zero".to_string(),
            ));
        }

        if self.negotiation_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "negotiation_timeout must be non-zero".to_string(),
            ));
        }

        if self.publish_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "publish_timeout must be non-zero".to_string(),
            ));
        }

        if self.join_retries > 32 {
            return Err(Error::InvalidConfig(format!(
                "join_retries must be at most 32, got {}",
                self.join_retries
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = EngineOptions::default();
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_zero_connect_timeout_fails() {
        let mut options = EngineOptions::default();
        options.signal.connect_timeout = Duration::ZERO;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_excessive_join_retries_fails() {
        let mut options = EngineOptions::default();
        options.join_retries = 100;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_options_serialization() {
        let options = EngineOptions::default();
        let json = serde_json::to_string(&options).unwrap();
        let deserialized: EngineOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(
            options.signal.connect_timeout,
            deserialized.signal.connect_timeout
        );
    }
}
