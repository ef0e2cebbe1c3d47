//! Media transport wrappers
//!
//! [`TransportLink`] owns exactly one peer connection (publisher or
//! subscriber role); [`TransportCoordinator`] owns the pair and reduces
//! their states into one aggregate view.

mod coordinator;
mod link;

use std::sync::Arc;

use roomlink_core::protocol::types::{IceCandidate, SessionDescription, TransportRole};
use webrtc::data_channel::RTCDataChannel;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

pub use coordinator::TransportCoordinator;
pub use link::{IceConfig, TransportLink};

pub(crate) use coordinator::to_rtc_ice_servers;

/// Reduced phase of one media transport, derived from the underlying
/// ICE/connection/signaling sub-states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created, no negotiation yet
    New,
    /// Negotiation or connectivity checks in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity was lost and cannot recover without a restart
    Failed,
    /// Local close in progress
    Closing,
    /// Closed
    Closed,
}

/// Events emitted by the transport links, consumed by the engine
pub enum TransportEvent {
    /// A local offer ready to be sent through signaling
    LocalOffer {
        /// Originating transport
        role: TransportRole,
        /// The offer
        description: SessionDescription,
    },
    /// A local ICE candidate ready to be sent through signaling
    LocalCandidate {
        /// Originating transport
        role: TransportRole,
        /// The candidate
        candidate: IceCandidate,
    },
    /// The reduced state of one transport changed
    StateChange {
        /// Originating transport
        role: TransportRole,
        /// New reduced state
        state: TransportState,
    },
    /// The remote side opened a data channel on this transport
    DataChannel {
        /// Originating transport
        role: TransportRole,
        /// The channel
        channel: Arc<RTCDataChannel>,
    },
    /// A remote media track arrived
    Track {
        /// Originating transport
        role: TransportRole,
        /// The track
        track: Arc<TrackRemote>,
        /// Its receiver
        receiver: Arc<RTCRtpReceiver>,
        /// Its transceiver
        transceiver: Arc<RTCRtpTransceiver>,
    },
}
