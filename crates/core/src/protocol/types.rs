//! Payload structs carried by the signaling envelope
//!
//! None of these use `skip_serializing_if`: the binary codec is not
//! self-describing, so every field must be present in every frame.

use serde::{Deserialize, Serialize};

/// Which of the two media transports a message refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportRole {
    /// Transport carrying locally published media
    Publisher,
    /// Transport carrying media received from the server
    Subscriber,
}

/// An SDP session description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDescription {
    /// "offer" or "answer"
    pub sdp_type: String,
    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: String) -> Self {
        Self {
            sdp_type: "offer".to_string(),
            sdp,
        }
    }

    /// Build an answer description
    pub fn answer(sdp: String) -> Self {
        Self {
            sdp_type: "answer".to_string(),
            sdp,
        }
    }
}

/// ICE candidate in its JSON init form
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    pub sdp_mid: Option<String>,
    /// Media description index
    pub sdp_m_line_index: Option<u16>,
}

/// An ICE candidate bound to one transport role
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trickle {
    /// Transport the candidate belongs to
    pub target: TransportRole,
    /// The candidate itself
    pub candidate: IceCandidate,
}

/// Kind of a published track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Request to publish a local track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddTrackRequest {
    /// Client-generated track id used to correlate the acknowledgement
    pub cid: String,
    /// Display name of the track
    pub name: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Whether the track starts muted
    pub muted: bool,
    /// Video width (0 for audio)
    pub width: u32,
    /// Video height (0 for audio)
    pub height: u32,
}

/// Server-side info about a published track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackInfo {
    /// Server-assigned track sid
    pub sid: String,
    /// Display name
    pub name: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Mute state
    pub muted: bool,
}

/// Acknowledgement of an `add_track` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackPublished {
    /// Client track id from the originating request
    pub cid: String,
    /// The published track
    pub track: TrackInfo,
}

/// Notification that a local track was unpublished
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackUnpublished {
    /// Server-assigned sid of the unpublished track
    pub track_sid: String,
}

/// Mute request / remote mute notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MuteRequest {
    /// Track sid
    pub sid: String,
    /// Desired mute state
    pub muted: bool,
}

/// Local participant metadata update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateMetadata {
    /// New metadata blob
    pub metadata: String,
    /// New display name, when changed
    pub name: Option<String>,
}

/// Receive settings for subscribed tracks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackSettings {
    /// Tracks the settings apply to
    pub track_sids: Vec<String>,
    /// Disable delivery entirely
    pub disabled: bool,
    /// Desired width hint
    pub width: u32,
    /// Desired height hint
    pub height: u32,
}

/// Subscribe / unsubscribe from remote tracks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionUpdate {
    /// Tracks to change
    pub track_sids: Vec<String>,
    /// Subscribe when true, unsubscribe when false
    pub subscribe: bool,
}

/// Identity of a negotiated data channel, replayed on resume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataChannelInfo {
    /// Channel label
    pub label: String,
    /// Negotiated stream id
    pub id: u16,
}

/// Client session snapshot replayed after a successful resume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    /// Current subscriber answer, when one exists
    pub answer: Option<SessionDescription>,
    /// Current subscription set
    pub subscription: SubscriptionUpdate,
    /// Client track ids of tracks published before the disruption
    pub publish_cids: Vec<String>,
    /// Data channels negotiated before the disruption
    pub data_channels: Vec<DataChannelInfo>,
}

/// Simulcast quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    /// Lowest resolution layer
    Low,
    /// Middle layer
    Medium,
    /// Highest resolution layer
    High,
}

/// One simulcast layer of a published video track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoLayer {
    /// Quality tier
    pub quality: VideoQuality,
    /// Layer width
    pub width: u32,
    /// Layer height
    pub height: u32,
}

/// Update the simulcast layers of a published video track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateVideoLayers {
    /// Track the layers belong to
    pub track_sid: String,
    /// Layers currently being published
    pub layers: Vec<VideoLayer>,
}

/// Grant or revoke permission to subscribe to local tracks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionPermission {
    /// Allow every participant
    pub all_participants: bool,
    /// Explicitly allowed participant identities
    pub allowed: Vec<String>,
}

/// Failure scenario the server should simulate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulateScenario {
    /// Drop the signaling connection
    SignalReconnect,
    /// Emit synthetic speaker updates
    SpeakerUpdate,
    /// Simulate a media node failure
    NodeFailure,
    /// Server-initiated leave
    ServerLeave,
    /// Migrate the session to another node
    Migration,
    /// Force candidates onto TCP
    ForceTcp,
    /// Force candidates onto TLS
    ForceTls,
}

/// Structured keepalive request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PingRequest {
    /// Client send time in unix milliseconds
    pub timestamp: i64,
    /// Last measured round-trip time in milliseconds
    pub rtt: i64,
}

/// Structured keepalive acknowledgement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PongResponse {
    /// Echo of the ping's send timestamp
    pub last_ping_timestamp: i64,
    /// Server time in unix milliseconds
    pub timestamp: i64,
}

/// What a leaving peer (client or server) intends to happen next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveAction {
    /// Session is over, do not reconnect
    Disconnect,
    /// Reconnect keeping the existing media transports
    Resume,
    /// Reconnect from scratch
    Reconnect,
}

/// Leave request / server-initiated leave
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Leave {
    /// What should happen next
    pub action: LeaveAction,
    /// Human-readable reason
    pub reason: String,
}

/// A participant in the session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantInfo {
    /// Server-assigned participant sid
    pub sid: String,
    /// Stable identity
    pub identity: String,
    /// Display name
    pub name: String,
    /// Application metadata blob
    pub metadata: String,
    /// Tracks published by this participant
    pub tracks: Vec<TrackInfo>,
}

/// Room-level metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomInfo {
    /// Server-assigned room sid
    pub sid: String,
    /// Room name
    pub name: String,
    /// Application metadata blob
    pub metadata: String,
}

/// ICE server entry handed out by the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceServerInfo {
    /// STUN/TURN urls
    pub urls: Vec<String>,
    /// TURN username, empty for STUN
    pub username: String,
    /// TURN credential, empty for STUN
    pub credential: String,
}

/// Server-pushed client configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ClientConfiguration {
    /// Restrict ICE to relay candidates
    pub force_relay: bool,
}

/// Payload of the `join` response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinPayload {
    /// The joined room
    pub room: RoomInfo,
    /// The local participant
    pub participant: ParticipantInfo,
    /// Everyone else already in the room
    pub other_participants: Vec<ParticipantInfo>,
    /// Server software version
    pub server_version: String,
    /// When true the subscriber transport is primary and the server
    /// initiates the first offer; the publisher negotiates lazily
    pub subscriber_primary: bool,
    /// ICE servers to use for both transports
    pub ice_servers: Vec<IceServerInfo>,
    /// Optional client configuration overrides
    pub client_configuration: Option<ClientConfiguration>,
    /// Keepalive send interval in seconds, 0 disables keepalive
    pub ping_interval: u32,
    /// Liveness deadline in seconds
    pub ping_timeout: u32,
    /// Publisher offers may be sent without debouncing
    pub fast_publish: bool,
}

/// Payload of the `reconnect` response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPayload {
    /// Possibly refreshed ICE servers
    pub ice_servers: Vec<IceServerInfo>,
    /// Optional client configuration overrides
    pub client_configuration: Option<ClientConfiguration>,
}

/// Participant roster update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantUpdate {
    /// Changed participants, full snapshots
    pub participants: Vec<ParticipantInfo>,
}

/// Room metadata update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomUpdate {
    /// New room state
    pub room: RoomInfo,
}

/// One active speaker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeakerInfo {
    /// Participant sid
    pub sid: String,
    /// Audio level in [0, 1]
    pub level: f32,
    /// Whether the participant is currently speaking
    pub active: bool,
}

/// Active speaker change notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeakersChanged {
    /// Updated speakers
    pub speakers: Vec<SpeakerInfo>,
}

/// Connection quality rating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    /// No issues observed
    Excellent,
    /// Minor degradation
    Good,
    /// Significant loss or jitter
    Poor,
    /// Connectivity effectively lost
    Lost,
}

/// Connection quality of one participant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionQualityInfo {
    /// Participant sid
    pub participant_sid: String,
    /// Current rating
    pub quality: ConnectionQuality,
}

/// Batched connection quality updates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionQualityUpdate {
    /// Updated participants
    pub updates: Vec<ConnectionQualityInfo>,
}

/// Delivery state of a remote track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Media is flowing
    Active,
    /// Delivery paused (congestion or adaptive stream)
    Paused,
}

/// Stream state change of one remote track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamStateInfo {
    /// Owning participant sid
    pub participant_sid: String,
    /// Track sid
    pub track_sid: String,
    /// New state
    pub state: StreamState,
}

/// Batched stream state updates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamStateUpdate {
    /// Changed tracks
    pub updates: Vec<StreamStateInfo>,
}

/// One subscribed simulcast quality
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SubscribedQuality {
    /// Quality tier
    pub quality: VideoQuality,
    /// Whether any subscriber wants this tier
    pub enabled: bool,
}

/// Qualities the server wants published for a local video track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribedQualityUpdate {
    /// Track the update applies to
    pub track_sid: String,
    /// Wanted tiers
    pub subscribed_qualities: Vec<SubscribedQuality>,
}

/// Subscription permission change for a local track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionPermissionUpdate {
    /// Subscribing participant
    pub participant_sid: String,
    /// Affected track
    pub track_sid: String,
    /// Whether the subscription is now allowed
    pub allowed: bool,
}

/// Result of a subscription attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionResponse {
    /// Track the response refers to
    pub track_sid: String,
    /// Error code, empty on success
    pub error: String,
}

/// Application data routed over a data channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPacket {
    /// Sending participant sid, empty when sent by the server
    pub participant_sid: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Application topic
    pub topic: Option<String>,
}
