//! Wire codec for the signaling envelope
//!
//! Messages travel as binary frames by default; JSON text frames are a
//! fallback negotiated by the caller for servers (or debugging proxies) that
//! cannot speak the binary format. Decoding is driven by the frame type
//! rather than the negotiated encoding, so a client configured for binary
//! still understands a JSON frame from an older server.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ProtocolError, Result};
use crate::protocol::{SignalRequest, SignalResponse};

/// Envelope encoding negotiated by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Compact binary framing (default)
    #[default]
    Binary,
    /// JSON text framing
    Json,
}

/// One websocket frame ready to send or just received
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// Binary frame
    Binary(Vec<u8>),
    /// Text frame
    Text(String),
}

impl Encoding {
    /// Encode an outgoing request
    pub fn encode_request(&self, req: &SignalRequest) -> Result<WireFrame> {
        encode(self, req)
    }

    /// Encode an outgoing response (used by servers and test harnesses)
    pub fn encode_response(&self, resp: &SignalResponse) -> Result<WireFrame> {
        encode(self, resp)
    }
}

fn encode<T: Serialize>(encoding: &Encoding, value: &T) -> Result<WireFrame> {
    match encoding {
        Encoding::Binary => bincode::serialize(value)
            .map(WireFrame::Binary)
            .map_err(|e| ProtocolError::Encode(e.to_string())),
        Encoding::Json => serde_json::to_string(value)
            .map(WireFrame::Text)
            .map_err(|e| ProtocolError::Encode(e.to_string())),
    }
}

fn decode<T: DeserializeOwned>(frame: &WireFrame) -> Result<T> {
    match frame {
        WireFrame::Binary(bytes) => {
            bincode::deserialize(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
        }
        WireFrame::Text(text) => {
            serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
        }
    }
}

/// Decode an inbound response frame, binary or JSON
pub fn decode_response(frame: &WireFrame) -> Result<SignalResponse> {
    decode(frame)
}

/// Decode an inbound request frame, binary or JSON
pub fn decode_request(frame: &WireFrame) -> Result<SignalRequest> {
    decode(frame)
}
