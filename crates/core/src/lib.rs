//! Core wire protocol for the RoomLink session client
//!
//! This crate defines the signaling message envelope exchanged with a session
//! server: a tagged union of request kinds (client to server) and response
//! kinds (server to client), the payload structs they carry, and the codec
//! used on the wire (binary by default, JSON as a negotiated fallback).
//!
//! Higher layers (the signaling client, transport coordinator and session
//! engine) live in the `roomlink-webrtc` crate and only ever touch the wire
//! through the types exported here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod protocol;

pub use error::{ProtocolError, Result};
pub use protocol::codec::{Encoding, WireFrame};
pub use protocol::{SignalRequest, SignalResponse};
