//! Connection-management core for RoomLink session clients
//!
//! This crate establishes and maintains a signaling channel to a session
//! server, negotiates up to two peer-to-peer media transports, and keeps the
//! session alive across network disruptions without losing
//! application-visible state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  SessionEngine                                       │
//! │  ├─ SignalClient (websocket signaling to <base>/rtc) │
//! │  ├─ TransportCoordinator                             │
//! │  │   ├─ TransportLink (publisher)                    │
//! │  │   └─ TransportLink (subscriber)                   │
//! │  ├─ DataChannelSet (lossy + reliable channels)       │
//! │  ├─ ReconnectPolicy (pluggable backoff)              │
//! │  └─ EndpointProvider (multi-region failover)         │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The engine owns one signaling client and one transport coordinator at a
//! time, wires signaling events (offer/answer/candidate/leave) to the
//! coordinator and local offers/candidates back into outgoing requests, and
//! implements the reconnection decision tree: a cheap "resume" that keeps
//! the media transports, and a full "restart" that rejoins from scratch.
//!
//! # Example
//!
//! ```ignore
//! use roomlink_webrtc::{EngineOptions, SessionEngine};
//!
//! let options = EngineOptions::default();
//! let (engine, mut events) = SessionEngine::connect(
//!     "wss://session.example.com",
//!     "<access token>",
//!     options,
//! ).await?;
//!
//! while let Some(event) = events.recv().await {
//!     // react to EngineEvent::Connected, ::DataReceived, ...
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod reconnect;
pub mod region;
pub mod signaling;
pub mod sync;
pub mod transport;

pub use channels::DataPacketKind;
pub use config::{EngineOptions, RtcOptions, SignalOptions};
pub use engine::{EngineEvent, EngineEvents, SessionEngine, SessionPhase};
pub use error::{Error, Result};
pub use reconnect::{DefaultReconnectPolicy, ReconnectContext, ReconnectPolicy, ReconnectReason};
pub use region::{EndpointProvider, RegionEndpointProvider};
pub use signaling::{SignalClient, SignalConnectionState, SignalEvent, SignalEvents};
pub use sync::CancelToken;
pub use transport::{TransportCoordinator, TransportLink, TransportState};
