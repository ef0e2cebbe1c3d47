//! Typed event surface exposed by the engine
//!
//! One subscription point per engine; the receiving half is handed out by
//! [`crate::SessionEngine::connect`] and dropping it is the total
//! unsubscribe.

use std::sync::Arc;

use roomlink_core::protocol::types::{
    ConnectionQualityUpdate, DataPacket, ParticipantUpdate, RoomUpdate, SpeakersChanged,
    StreamStateUpdate, SubscribedQualityUpdate, SubscriptionPermissionUpdate,
    SubscriptionResponse, TransportRole,
};
use tokio::sync::mpsc;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::channels::DataPacketKind;

/// Receiving half of the engine event stream
pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

/// Events consumed by the room/participant layer above the engine
pub enum EngineEvent {
    /// The session reached connected for the first time
    Connected,
    /// Terminal: the session is over and no reconnection will be attempted
    Disconnected {
        /// Why the session ended
        reason: String,
    },
    /// A resume (signaling + ICE restart) attempt started
    Resuming,
    /// The resume completed; transports were kept
    Resumed,
    /// A full restart (fresh join) attempt started
    Restarting,
    /// The restart completed; everything was rebuilt
    Restarted,
    /// The signaling channel came back during a resume
    SignalResumed,
    /// The signaling channel came back during a restart
    SignalRestarted,
    /// The last restart failed because the server was unreachable
    Offline,
    /// A remote media track arrived on the subscriber transport
    MediaTrack {
        /// Transport that delivered the track
        role: TransportRole,
        /// The track
        track: Arc<TrackRemote>,
        /// Its receiver
        receiver: Arc<RTCRtpReceiver>,
        /// Its transceiver
        transceiver: Arc<RTCRtpTransceiver>,
    },
    /// An application data packet arrived
    DataReceived {
        /// The decoded packet
        packet: DataPacket,
        /// Channel class it arrived on
        kind: DataPacketKind,
    },
    /// Participant roster changed
    ParticipantUpdate(ParticipantUpdate),
    /// Room metadata changed
    RoomUpdate(RoomUpdate),
    /// Active speakers changed
    SpeakersChanged(SpeakersChanged),
    /// Remote track delivery paused or resumed
    StreamStateUpdate(StreamStateUpdate),
    /// Connection quality updates
    ConnectionQuality(ConnectionQualityUpdate),
    /// A subscription attempt failed
    SubscriptionError(SubscriptionResponse),
    /// Subscription permission changed on a local track
    SubscriptionPermissionUpdate(SubscriptionPermissionUpdate),
    /// The server wants different simulcast layers published
    SubscribedQualityUpdate(SubscribedQualityUpdate),
    /// A local track was unpublished by the server
    LocalTrackUnpublished {
        /// The track's sid
        track_sid: String,
    },
    /// A published track was muted or unmuted remotely
    RemoteMute {
        /// The track's sid
        sid: String,
        /// New mute state
        muted: bool,
    },
    /// The server rotated the access token; use it for the next reconnect
    RefreshToken {
        /// The fresh token
        token: String,
    },
    /// Backpressure signal of one data channel kind changed
    DataChannelBufferStatus {
        /// Channel class
        kind: DataPacketKind,
        /// True when the send buffer dropped below the threshold
        low: bool,
    },
}

// Hand-written: the media payloads wrap stack types without Debug impls
impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Connected => f.write_str("Connected"),
            EngineEvent::Disconnected { reason } => {
                f.debug_struct("Disconnected").field("reason", reason).finish()
            }
            EngineEvent::Resuming => f.write_str("Resuming"),
            EngineEvent::Resumed => f.write_str("Resumed"),
            EngineEvent::Restarting => f.write_str("Restarting"),
            EngineEvent::Restarted => f.write_str("Restarted"),
            EngineEvent::SignalResumed => f.write_str("SignalResumed"),
            EngineEvent::SignalRestarted => f.write_str("SignalRestarted"),
            EngineEvent::Offline => f.write_str("Offline"),
            EngineEvent::MediaTrack { role, .. } => f
                .debug_struct("MediaTrack")
                .field("role", role)
                .finish_non_exhaustive(),
            EngineEvent::DataReceived { packet, kind } => f
                .debug_struct("DataReceived")
                .field("kind", kind)
                .field("bytes", &packet.payload.len())
                .finish(),
            EngineEvent::ParticipantUpdate(update) => {
                f.debug_tuple("ParticipantUpdate").field(update).finish()
            }
            EngineEvent::RoomUpdate(update) => f.debug_tuple("RoomUpdate").field(update).finish(),
            EngineEvent::SpeakersChanged(update) => {
                f.debug_tuple("SpeakersChanged").field(update).finish()
            }
            EngineEvent::StreamStateUpdate(update) => {
                f.debug_tuple("StreamStateUpdate").field(update).finish()
            }
            EngineEvent::ConnectionQuality(update) => {
                f.debug_tuple("ConnectionQuality").field(update).finish()
            }
            EngineEvent::SubscriptionError(response) => {
                f.debug_tuple("SubscriptionError").field(response).finish()
            }
            EngineEvent::SubscriptionPermissionUpdate(update) => f
                .debug_tuple("SubscriptionPermissionUpdate")
                .field(update)
                .finish(),
            EngineEvent::SubscribedQualityUpdate(update) => f
                .debug_tuple("SubscribedQualityUpdate")
                .field(update)
                .finish(),
            EngineEvent::LocalTrackUnpublished { track_sid } => f
                .debug_struct("LocalTrackUnpublished")
                .field("track_sid", track_sid)
                .finish(),
            EngineEvent::RemoteMute { sid, muted } => f
                .debug_struct("RemoteMute")
                .field("sid", sid)
                .field("muted", muted)
                .finish(),
            EngineEvent::RefreshToken { .. } => f.write_str("RefreshToken"),
            EngineEvent::DataChannelBufferStatus { kind, low } => f
                .debug_struct("DataChannelBufferStatus")
                .field("kind", kind)
                .field("low", low)
                .finish(),
        }
    }
}
