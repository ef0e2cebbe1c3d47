//! Signaling message envelope
//!
//! The wire protocol is a tagged union in each direction: [`SignalRequest`]
//! for client-to-server messages and [`SignalResponse`] for server-to-client
//! messages. Both serialize with the variant name as the tag, so the JSON
//! form of a request is `{"offer": {...}}` and the binary form carries the
//! variant index, which keeps the envelope compatible with both codecs.

pub mod codec;
pub mod types;

use serde::{Deserialize, Serialize};

pub use types::*;

/// Client-to-server signaling requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SignalRequest {
    /// Publisher SDP offer
    Offer(SessionDescription),
    /// Subscriber SDP answer
    Answer(SessionDescription),
    /// Local ICE candidate for one of the two transports
    Trickle(Trickle),
    /// Mute or unmute a published track
    Mute(MuteRequest),
    /// Publish a local track; acknowledged by `track_published`
    AddTrack(AddTrackRequest),
    /// Update local participant metadata
    UpdateMetadata(UpdateMetadata),
    /// Update receive settings for subscribed tracks
    TrackSettings(TrackSettings),
    /// Subscribe or unsubscribe from remote tracks
    SubscriptionUpdate(SubscriptionUpdate),
    /// Replay client-side session state after a resume
    SyncState(SyncState),
    /// Update simulcast layers for a published video track
    UpdateVideoLayers(UpdateVideoLayers),
    /// Grant or revoke subscription permissions on local tracks
    SubscriptionPermission(SubscriptionPermission),
    /// Ask the server to simulate a failure scenario
    Simulate(SimulateScenario),
    /// Legacy keepalive frame (timestamp only)
    Ping(i64),
    /// Structured keepalive frame carrying the last measured RTT
    PingReq(PingRequest),
    /// Leave the session
    Leave(Leave),
}

impl SignalRequest {
    /// Wire name of the request kind
    pub fn kind(&self) -> &'static str {
        match self {
            SignalRequest::Offer(_) => "offer",
            SignalRequest::Answer(_) => "answer",
            SignalRequest::Trickle(_) => "trickle",
            SignalRequest::Mute(_) => "mute",
            SignalRequest::AddTrack(_) => "add_track",
            SignalRequest::UpdateMetadata(_) => "update_metadata",
            SignalRequest::TrackSettings(_) => "track_settings",
            SignalRequest::SubscriptionUpdate(_) => "subscription_update",
            SignalRequest::SyncState(_) => "sync_state",
            SignalRequest::UpdateVideoLayers(_) => "update_video_layers",
            SignalRequest::SubscriptionPermission(_) => "subscription_permission",
            SignalRequest::Simulate(_) => "simulate",
            SignalRequest::Ping(_) => "ping",
            SignalRequest::PingReq(_) => "ping_req",
            SignalRequest::Leave(_) => "leave",
        }
    }

    /// Whether this request may be written to the channel while the
    /// signaling client is reconnecting.
    ///
    /// These kinds are either reconnection-critical (SDP, candidates,
    /// sync state, leave) or idempotent (simulate, keepalive) and must not
    /// wait in the pending queue.
    pub fn bypasses_queue(&self) -> bool {
        matches!(
            self,
            SignalRequest::Offer(_)
                | SignalRequest::Answer(_)
                | SignalRequest::Trickle(_)
                | SignalRequest::SyncState(_)
                | SignalRequest::Simulate(_)
                | SignalRequest::Leave(_)
                | SignalRequest::Ping(_)
                | SignalRequest::PingReq(_)
        )
    }
}

/// Server-to-client signaling responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SignalResponse {
    /// First message of a fresh session; carries the full session setup
    Join(JoinPayload),
    /// Answer to a publisher offer
    Answer(SessionDescription),
    /// Subscriber offer initiated by the server
    Offer(SessionDescription),
    /// Remote ICE candidate for one of the two transports
    Trickle(Trickle),
    /// Participant roster changes
    Update(ParticipantUpdate),
    /// Acknowledgement of an `add_track` request
    TrackPublished(TrackPublished),
    /// A previously published local track was unpublished by the server
    TrackUnpublished(TrackUnpublished),
    /// Active speaker changes
    SpeakersChanged(SpeakersChanged),
    /// Server-initiated leave, possibly allowing reconnection
    Leave(Leave),
    /// A published track was muted or unmuted remotely
    Mute(MuteRequest),
    /// Room metadata changes
    RoomUpdate(RoomUpdate),
    /// Per-participant connection quality updates
    ConnectionQuality(ConnectionQualityUpdate),
    /// Remote track stream state changes (paused/active)
    StreamStateUpdate(StreamStateUpdate),
    /// Simulcast qualities the server wants published
    SubscribedQualityUpdate(SubscribedQualityUpdate),
    /// Subscription permission changed for a local track
    SubscriptionPermissionUpdate(SubscriptionPermissionUpdate),
    /// Rotated access token to use for the next reconnect
    RefreshToken(String),
    /// Result of a subscription attempt
    SubscriptionResponse(SubscriptionResponse),
    /// Acknowledgement of a successful reconnect handshake
    Reconnect(ReconnectPayload),
    /// Legacy keepalive acknowledgement (timestamp only, liveness signal)
    Pong(i64),
    /// Structured keepalive acknowledgement; authoritative for RTT
    PongResp(PongResponse),
}

impl SignalResponse {
    /// Wire name of the response kind
    pub fn kind(&self) -> &'static str {
        match self {
            SignalResponse::Join(_) => "join",
            SignalResponse::Answer(_) => "answer",
            SignalResponse::Offer(_) => "offer",
            SignalResponse::Trickle(_) => "trickle",
            SignalResponse::Update(_) => "update",
            SignalResponse::TrackPublished(_) => "track_published",
            SignalResponse::TrackUnpublished(_) => "track_unpublished",
            SignalResponse::SpeakersChanged(_) => "speakers_changed",
            SignalResponse::Leave(_) => "leave",
            SignalResponse::Mute(_) => "mute",
            SignalResponse::RoomUpdate(_) => "room_update",
            SignalResponse::ConnectionQuality(_) => "connection_quality",
            SignalResponse::StreamStateUpdate(_) => "stream_state_update",
            SignalResponse::SubscribedQualityUpdate(_) => "subscribed_quality_update",
            SignalResponse::SubscriptionPermissionUpdate(_) => "subscription_permission_update",
            SignalResponse::RefreshToken(_) => "refresh_token",
            SignalResponse::SubscriptionResponse(_) => "subscription_response",
            SignalResponse::Reconnect(_) => "reconnect",
            SignalResponse::Pong(_) => "pong",
            SignalResponse::PongResp(_) => "pong_resp",
        }
    }
}
