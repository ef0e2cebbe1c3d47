//! Session engine
//!
//! Top-level orchestrator: owns one [`SignalClient`] and one
//! [`TransportCoordinator`] at a time, wires signaling traffic to the
//! transports and local offers/candidates back into outgoing requests,
//! implements the reconnection decision tree, manages the data channel
//! pair, and correlates asynchronous publish acknowledgements.

mod events;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use roomlink_core::protocol::types::{
    AddTrackRequest, ClientConfiguration, DataPacket, IceServerInfo, JoinPayload, Leave,
    LeaveAction, SessionDescription, SimulateScenario, SubscriptionUpdate, SyncState, TrackInfo,
    TransportRole, Trickle,
};
use roomlink_core::{SignalRequest, SignalResponse};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::channels::{DataChannelSet, DataPacketKind};
use crate::config::EngineOptions;
use crate::error::{Error, Result};
use crate::reconnect::{
    DefaultReconnectPolicy, ReconnectContext, ReconnectPolicy, ReconnectReason,
};
use crate::region::EndpointProvider;
use crate::signaling::{SignalClient, SignalEvent, SignalEvents};
use crate::sync::CancelToken;
use crate::transport::{
    to_rtc_ice_servers, IceConfig, TransportCoordinator, TransportEvent, TransportState,
};

pub use events::{EngineEvent, EngineEvents};

/// Pause between initial-join attempts against an unreachable server
const JOIN_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Coarse engine-level state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, not yet connected
    New,
    /// Session is up
    Connected,
    /// A reconnect burst is in progress
    Reconnecting,
    /// Terminal: the session ended and will not reconnect
    Disconnected,
    /// Closed by the caller
    Closed,
}

/// Top-level session engine
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    options: EngineOptions,
    signal: SignalClient,
    coordinator: Mutex<Option<Arc<TransportCoordinator>>>,
    channels: DataChannelSet,

    phase: Mutex<SessionPhase>,
    url: RwLock<String>,
    token: RwLock<String>,
    session_sid: RwLock<Option<String>>,

    /// The next reconnect attempt must take the full restart path
    full_reconnect_on_next: AtomicBool,
    /// Attempts made in the current retry burst
    reconnect_attempts: AtomicU32,
    /// Set once per retry burst, not per attempt
    reconnect_start: Mutex<Option<Instant>>,
    /// At most one reconnect attempt in flight
    attempting_reconnect: AtomicBool,
    /// The coordinator reached connected at least once
    has_connected: AtomicBool,

    /// Publish acknowledgements keyed by client track id
    pending_publish: Mutex<HashMap<String, oneshot::Sender<TrackInfo>>>,
    published_cids: Mutex<Vec<String>>,

    emitter: mpsc::UnboundedSender<EngineEvent>,
    transport_events_tx: mpsc::UnboundedSender<TransportEvent>,

    policy: Box<dyn ReconnectPolicy>,
    endpoints: Option<Box<dyn EndpointProvider>>,

    closed: AtomicBool,
    /// Serializes the close path
    close_lock: AsyncMutex<()>,
    /// Keeps inbound data messages in arrival order across async decoding
    data_order_lock: Arc<AsyncMutex<()>>,
    /// Serializes read-modify-write sequences on RTP encoding parameters
    sender_params_lock: AsyncMutex<()>,
    cancel: CancelToken,
}

impl SessionEngine {
    /// Connect with the default reconnect policy and no region failover
    pub async fn connect(
        url: &str,
        token: &str,
        options: EngineOptions,
    ) -> Result<(Self, EngineEvents)> {
        Self::connect_with(
            url,
            token,
            options,
            Box::new(DefaultReconnectPolicy::default()),
            None,
        )
        .await
    }

    /// Connect with a custom backoff policy and optional endpoint provider
    pub async fn connect_with(
        url: &str,
        token: &str,
        options: EngineOptions,
        policy: Box<dyn ReconnectPolicy>,
        endpoints: Option<Box<dyn EndpointProvider>>,
    ) -> Result<(Self, EngineEvents)> {
        options.validate()?;

        let (emitter, events) = mpsc::unbounded_channel();
        let (signal, signal_events) = SignalClient::new(options.signal.clone());
        let (transport_events_tx, transport_events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(EngineInner {
            channels: DataChannelSet::new(emitter.clone()),
            options,
            signal,
            coordinator: Mutex::new(None),
            phase: Mutex::new(SessionPhase::New),
            url: RwLock::new(url.to_string()),
            token: RwLock::new(token.to_string()),
            session_sid: RwLock::new(None),
            full_reconnect_on_next: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            reconnect_start: Mutex::new(None),
            attempting_reconnect: AtomicBool::new(false),
            has_connected: AtomicBool::new(false),
            pending_publish: Mutex::new(HashMap::new()),
            published_cids: Mutex::new(Vec::new()),
            emitter,
            transport_events_tx,
            policy,
            endpoints,
            closed: AtomicBool::new(false),
            close_lock: AsyncMutex::new(()),
            data_order_lock: Arc::new(AsyncMutex::new(())),
            sender_params_lock: AsyncMutex::new(()),
            cancel: CancelToken::new(),
        });

        let join = inner.initial_join(url, token).await?;
        inner.configure_session(&join).await?;

        *inner.phase.lock() = SessionPhase::Connected;
        let _ = inner.emitter.send(EngineEvent::Connected);

        tokio::spawn(EngineInner::signal_loop(Arc::clone(&inner), signal_events));
        tokio::spawn(EngineInner::transport_loop(
            Arc::clone(&inner),
            transport_events_rx,
        ));

        // Publisher-primary sessions negotiate an initial offer right away
        if !join.subscriber_primary {
            let negotiate_inner = Arc::clone(&inner);
            tokio::spawn(async move {
                negotiate_inner.initial_negotiation().await;
            });
        }

        Ok((Self { inner }, events))
    }

    /// Current coarse phase
    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.lock()
    }

    /// Last measured signaling round-trip time in milliseconds
    pub fn signal_rtt_ms(&self) -> i64 {
        self.inner.signal.rtt_ms()
    }

    /// Whether the send buffer of the given channel kind is below the
    /// backpressure threshold
    pub fn is_buffer_low(&self, kind: DataPacketKind) -> bool {
        self.inner.channels.is_buffer_low(kind)
    }

    /// The current transport coordinator, when one exists
    pub fn coordinator(&self) -> Option<Arc<TransportCoordinator>> {
        self.inner.coordinator.lock().clone()
    }

    /// Address of the selected remote candidate for the given role
    pub async fn selected_address(&self, role: TransportRole) -> Option<String> {
        let coordinator = self.coordinator()?;
        coordinator.selected_address(role).await
    }

    /// Publish a local track and wait for the server acknowledgement.
    ///
    /// Rejects synchronously when a request with the same client track id
    /// is already pending, and rejects after a fixed deadline when no
    /// acknowledgement arrives.
    pub async fn add_track(&self, request: AddTrackRequest) -> Result<TrackInfo> {
        self.inner.add_track(request).await
    }

    /// Cancel a pending publish and forget the track.
    ///
    /// A pending `add_track` for the same client id rejects immediately,
    /// without another network round trip.
    pub fn remove_track(&self, cid: &str) {
        if self.inner.pending_publish.lock().remove(cid).is_some() {
            debug!(cid, "pending publish cancelled");
        }
        self.inner.published_cids.lock().retain(|c| c != cid);
    }

    /// Serialize a data packet and send it on the given channel kind,
    /// lazily bringing up the publisher transport if needed
    pub async fn send_data_packet(&self, packet: DataPacket, kind: DataPacketKind) -> Result<()> {
        self.inner.send_data_packet(packet, kind).await
    }

    /// Run a read-modify-write sequence on RTP encoding parameters under
    /// the engine-wide sender lock; some platforms fault if such sequences
    /// interleave
    pub async fn with_sender_params_lock<F, Fut, T>(&self, section: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.inner.sender_params_lock.lock().await;
        section().await
    }

    /// Ask the server to simulate a failure scenario
    pub async fn simulate(&self, scenario: SimulateScenario) -> Result<()> {
        match scenario {
            SimulateScenario::SignalReconnect => {
                self.inner.signal.close(false).await;
                self.inner.handle_disconnect(
                    "simulated signal reconnect",
                    ReconnectReason::SignalClosed,
                    false,
                    false,
                );
            }
            SimulateScenario::ForceTcp | SimulateScenario::ForceTls => {
                self.inner
                    .signal
                    .send(SignalRequest::Simulate(scenario))
                    .await;
                self.inner.handle_disconnect(
                    "simulated candidate protocol switch",
                    ReconnectReason::ServerLeave,
                    true,
                    true,
                );
            }
            other => {
                self.inner.signal.send(SignalRequest::Simulate(other)).await;
            }
        }
        Ok(())
    }

    /// Close the engine: leave the session, tear down the signaling
    /// channel and both transports. Idempotent.
    pub async fn close(&self) {
        self.inner.close_inner(SessionPhase::Closed).await;
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        // Stops the event pump tasks if the caller never closed
        self.inner.cancel.cancel();
    }
}

impl EngineInner {
    /// First join, retried a bounded number of times while the server is
    /// unreachable
    async fn initial_join(&self, url: &str, token: &str) -> Result<JoinPayload> {
        let mut attempt = 0u32;
        loop {
            match self.signal.join(url, token, &self.cancel).await {
                Ok(join) => return Ok(join),
                Err(e) if e.is_unreachable() && attempt < self.options.join_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max = self.options.join_retries,
                        "server unreachable, retrying join: {e}"
                    );
                    tokio::time::sleep(JOIN_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply a join payload: remember the session identity and stand up
    /// the transport pair if none is usable
    async fn configure_session(self: &Arc<Self>, join: &JoinPayload) -> Result<()> {
        *self.session_sid.write() = Some(join.participant.sid.clone());

        if let Some(existing) = self.coordinator.lock().clone() {
            if existing.aggregate_state() != TransportState::Closed {
                return Ok(());
            }
        }

        let ice = self.ice_config(&join.ice_servers, join.client_configuration);
        let coordinator = Arc::new(
            TransportCoordinator::new(
                join.subscriber_primary,
                ice,
                self.options.negotiation_timeout,
                self.transport_events_tx.clone(),
            )
            .await?,
        );

        self.channels
            .create_publisher_channels(coordinator.publisher().peer_connection())
            .await?;

        let aggregate_rx = coordinator.subscribe();
        *self.coordinator.lock() = Some(Arc::clone(&coordinator));

        tokio::spawn(EngineInner::aggregate_loop(Arc::clone(self), aggregate_rx));
        Ok(())
    }

    /// Caller-supplied ICE servers win over the server-provided set
    fn ice_config(
        &self,
        from_server: &[IceServerInfo],
        client_config: Option<ClientConfiguration>,
    ) -> IceConfig {
        let servers = if self.options.rtc.ice_servers.is_empty() {
            to_rtc_ice_servers(from_server)
        } else {
            self.options
                .rtc
                .ice_servers
                .iter()
                .map(|entry| webrtc::ice_transport::ice_server::RTCIceServer {
                    urls: entry.urls.clone(),
                    username: entry.username.clone(),
                    credential: entry.credential.clone(),
                    ..Default::default()
                })
                .collect()
        };

        let force_relay = self.options.rtc.force_relay
            || client_config.map(|c| c.force_relay).unwrap_or(false);

        IceConfig {
            servers,
            force_relay,
        }
    }

    fn coordinator(&self) -> Result<Arc<TransportCoordinator>> {
        self.coordinator
            .lock()
            .clone()
            .ok_or_else(|| Error::UnrecoverableState("engine has no transports".to_string()))
    }

    async fn signal_loop(inner: Arc<EngineInner>, mut events: SignalEvents) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SignalEvent::Message(msg)) => {
                        if let Err(e) = inner.on_signal_message(*msg).await {
                            warn!("failed to handle signal message: {e}");
                        }
                    }
                    Some(SignalEvent::Close(reason)) => {
                        if !inner.closed.load(Ordering::Acquire) {
                            inner.handle_disconnect(
                                &format!("signal closed: {reason}"),
                                ReconnectReason::SignalClosed,
                                false,
                                false,
                            );
                        }
                    }
                    None => break,
                },
                _ = inner.cancel.cancelled() => break,
            }
        }
        debug!("signal loop terminated");
    }

    async fn on_signal_message(self: &Arc<Self>, message: SignalResponse) -> Result<()> {
        match message {
            SignalResponse::Answer(answer) => {
                debug!("received publisher answer");
                self.coordinator()?.publisher().set_remote_answer(answer).await?;
            }
            SignalResponse::Offer(offer) => {
                debug!("received subscriber offer");
                let answer = self
                    .coordinator()?
                    .subscriber()
                    .create_answer_from_offer(offer)
                    .await?;
                self.signal.send(SignalRequest::Answer(answer)).await;
            }
            SignalResponse::Trickle(trickle) => {
                self.coordinator()?
                    .link(trickle.target)
                    .add_remote_candidate(trickle.candidate)
                    .await?;
            }
            SignalResponse::Leave(leave) => {
                debug!(?leave.action, reason = %leave.reason, "server leave");
                match leave.action {
                    LeaveAction::Disconnect => {
                        self.terminate(format!("server requested leave: {}", leave.reason))
                            .await;
                    }
                    LeaveAction::Resume | LeaveAction::Reconnect => {
                        // Server wants us back right now, from scratch
                        self.handle_disconnect(
                            "server leave",
                            ReconnectReason::ServerLeave,
                            true,
                            true,
                        );
                    }
                }
            }
            SignalResponse::TrackPublished(published) => {
                let sender = self.pending_publish.lock().remove(&published.cid);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(published.track);
                    }
                    None => debug!(cid = %published.cid, "unmatched publish acknowledgement"),
                }
            }
            SignalResponse::TrackUnpublished(unpublished) => {
                let _ = self.emitter.send(EngineEvent::LocalTrackUnpublished {
                    track_sid: unpublished.track_sid,
                });
            }
            SignalResponse::Update(update) => {
                let _ = self.emitter.send(EngineEvent::ParticipantUpdate(update));
            }
            SignalResponse::RoomUpdate(update) => {
                let _ = self.emitter.send(EngineEvent::RoomUpdate(update));
            }
            SignalResponse::SpeakersChanged(speakers) => {
                let _ = self.emitter.send(EngineEvent::SpeakersChanged(speakers));
            }
            SignalResponse::ConnectionQuality(quality) => {
                let _ = self.emitter.send(EngineEvent::ConnectionQuality(quality));
            }
            SignalResponse::StreamStateUpdate(update) => {
                let _ = self.emitter.send(EngineEvent::StreamStateUpdate(update));
            }
            SignalResponse::SubscribedQualityUpdate(update) => {
                let _ = self
                    .emitter
                    .send(EngineEvent::SubscribedQualityUpdate(update));
            }
            SignalResponse::SubscriptionPermissionUpdate(update) => {
                let _ = self
                    .emitter
                    .send(EngineEvent::SubscriptionPermissionUpdate(update));
            }
            SignalResponse::SubscriptionResponse(response) => {
                if response.error.is_empty() {
                    debug!(track_sid = %response.track_sid, "subscription confirmed");
                } else {
                    let _ = self.emitter.send(EngineEvent::SubscriptionError(response));
                }
            }
            SignalResponse::Mute(mute) => {
                let _ = self.emitter.send(EngineEvent::RemoteMute {
                    sid: mute.sid,
                    muted: mute.muted,
                });
            }
            SignalResponse::RefreshToken(token) => {
                *self.token.write() = token.clone();
                let _ = self.emitter.send(EngineEvent::RefreshToken { token });
            }
            // Handled by the signaling layer during handshakes/keepalive
            SignalResponse::Join(_)
            | SignalResponse::Reconnect(_)
            | SignalResponse::Pong(_)
            | SignalResponse::PongResp(_) => {
                debug!("ignoring handshake message outside its handshake")
            }
        }

        Ok(())
    }

    async fn transport_loop(
        inner: Arc<EngineInner>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::LocalOffer { role, description }) => {
                        if role == TransportRole::Publisher {
                            inner.signal.send(SignalRequest::Offer(description)).await;
                        }
                    }
                    Some(TransportEvent::LocalCandidate { role, candidate }) => {
                        inner
                            .signal
                            .send(SignalRequest::Trickle(Trickle {
                                target: role,
                                candidate,
                            }))
                            .await;
                    }
                    Some(TransportEvent::StateChange { role, state }) => {
                        debug!(?role, ?state, "transport state change");
                    }
                    Some(TransportEvent::DataChannel { role, channel }) => {
                        if role == TransportRole::Subscriber {
                            inner.channels.register_subscriber_channel(
                                channel,
                                Arc::clone(&inner.data_order_lock),
                            );
                        }
                    }
                    Some(TransportEvent::Track { role, track, receiver, transceiver }) => {
                        let _ = inner.emitter.send(EngineEvent::MediaTrack {
                            role,
                            track,
                            receiver,
                            transceiver,
                        });
                    }
                    None => break,
                },
                _ = inner.cancel.cancelled() => break,
            }
        }
        debug!("transport loop terminated");
    }

    /// Track the aggregate transport state of the current coordinator
    async fn aggregate_loop(inner: Arc<EngineInner>, mut rx: watch::Receiver<TransportState>) {
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = inner.cancel.cancelled() => break,
            }

            let state = *rx.borrow();
            match state {
                TransportState::Connected => {
                    inner.has_connected.store(true, Ordering::Release);
                }
                TransportState::Failed => {
                    if !inner.closed.load(Ordering::Acquire) {
                        inner.handle_disconnect(
                            "peerconnection failed",
                            ReconnectReason::TransportFailed,
                            false,
                            false,
                        );
                    }
                }
                _ => {}
            }
        }
        debug!("aggregate loop terminated");
    }

    async fn initial_negotiation(self: &Arc<Self>) {
        let Ok(coordinator) = self.coordinator() else {
            return;
        };
        if let Err(e) = coordinator.negotiate(&self.cancel).await {
            warn!("initial publisher negotiation failed: {e}");
            self.escalate_if_needed(&e);
        }
    }

    /// A failed SDP round trip taints the transports: the next reconnect
    /// attempt must take the full restart path rather than resume
    fn escalate_if_needed(&self, error: &Error) {
        if error.escalates_to_restart() {
            self.full_reconnect_on_next.store(true, Ordering::Release);
        }
    }

    /// Entry point of the reconnection decision tree.
    ///
    /// Refuses to schedule when an attempt is already in flight. The
    /// spawned loop consults the backoff policy before every attempt and
    /// classifies failures recoverable vs fatal.
    fn handle_disconnect(
        self: &Arc<Self>,
        source: &str,
        reason: ReconnectReason,
        retry_now: bool,
        force_full: bool,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        if self.attempting_reconnect.swap(true, Ordering::AcqRel) {
            debug!(source, "reconnect attempt already in flight");
            return;
        }

        warn!(source, "connection lost, entering reconnection");

        if force_full {
            self.full_reconnect_on_next.store(true, Ordering::Release);
        }

        {
            // The burst start is set once per burst, not per attempt
            let mut start = self.reconnect_start.lock();
            if start.is_none() {
                *start = Some(Instant::now());
            }
        }

        *self.phase.lock() = SessionPhase::Reconnecting;

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.reconnect_loop(reason, retry_now).await;
        });
    }

    async fn reconnect_loop(self: Arc<Self>, reason: ReconnectReason, mut retry_now: bool) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                self.attempting_reconnect.store(false, Ordering::Release);
                return;
            }

            let context = ReconnectContext {
                retry_count: self.reconnect_attempts.load(Ordering::Acquire),
                elapsed: self
                    .reconnect_start
                    .lock()
                    .map(|start| start.elapsed())
                    .unwrap_or_default(),
                reason: Some(reason),
                server_url: self.url.read().clone(),
            };

            // A failing policy stops retries: fail closed, not open
            let delay = match self.policy.next_delay(&context) {
                Ok(delay) => delay,
                Err(e) => {
                    warn!("reconnect policy failed, stopping retries: {e}");
                    None
                }
            };

            let Some(mut delay) = delay else {
                self.attempting_reconnect.store(false, Ordering::Release);
                self.terminate("reconnection attempts exhausted".to_string())
                    .await;
                return;
            };

            if retry_now {
                delay = Duration::ZERO;
                retry_now = false;
            }

            debug!(attempt = context.retry_count, ?delay, "reconnect attempt scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.attempting_reconnect.store(false, Ordering::Release);
                    return;
                }
            }

            match self.attempt_reconnect(reason).await {
                Ok(()) => {
                    info!("session re-established");
                    self.reconnect_attempts.store(0, Ordering::Release);
                    *self.reconnect_start.lock() = None;
                    self.attempting_reconnect.store(false, Ordering::Release);
                    *self.phase.lock() = SessionPhase::Connected;
                    return;
                }
                Err(e) if !e.is_recoverable() => {
                    self.attempting_reconnect.store(false, Ordering::Release);
                    self.terminate(format!("unrecoverable reconnect failure: {e}"))
                        .await;
                    return;
                }
                Err(e) => {
                    warn!("reconnect attempt failed: {e}");
                    self.full_reconnect_on_next.store(true, Ordering::Release);
                    self.reconnect_attempts.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
    }

    /// Resume unless the full path is forced or the transports never came
    /// up in the first place
    async fn attempt_reconnect(self: &Arc<Self>, reason: ReconnectReason) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UnrecoverableState("engine is closed".to_string()));
        }

        let full = self.full_reconnect_on_next.swap(false, Ordering::AcqRel)
            || !self.has_connected.load(Ordering::Acquire);

        if full {
            self.restart_connection(None).await
        } else {
            self.resume_connection(reason).await
        }
    }

    /// Full reconnect: tear everything down and rejoin from scratch,
    /// failing over to alternate endpoints when a provider is configured
    async fn restart_connection(self: &Arc<Self>, alternate_url: Option<String>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UnrecoverableState("engine is closed".to_string()));
        }

        let _ = self.emitter.send(EngineEvent::Restarting);
        info!("restarting connection");

        // Best-effort goodbye on whatever channel is left
        self.signal
            .send(SignalRequest::Leave(Leave {
                action: LeaveAction::Disconnect,
                reason: "restarting".to_string(),
            }))
            .await;
        self.signal.close(false).await;

        let coordinator = self.coordinator.lock().take();
        if let Some(coordinator) = coordinator {
            coordinator.close().await;
        }
        self.channels.close().await;
        self.has_connected.store(false, Ordering::Release);

        let url = alternate_url.unwrap_or_else(|| self.url.read().clone());
        let token = self.token.read().clone();

        let result: Result<()> = async {
            let join = self.signal.join(&url, &token, &self.cancel).await?;
            *self.url.write() = url.clone();
            let _ = self.emitter.send(EngineEvent::SignalRestarted);

            self.configure_session(&join).await?;

            let coordinator = self.coordinator()?;
            coordinator
                .ensure_connected(&self.cancel, self.options.transport_timeout)
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.signal.flush_queue().await;
                let _ = self.emitter.send(EngineEvent::Restarted);
                Ok(())
            }
            Err(e) => {
                warn!(%url, "restart failed: {e}");
                if e.is_unreachable() {
                    let _ = self.emitter.send(EngineEvent::Offline);
                }

                if let Some(provider) = &self.endpoints {
                    provider.report_failure(&url).await;
                    if let Some(next) = provider.next_url().await {
                        info!(%next, "failing over to alternate endpoint");
                        return Box::pin(self.restart_connection(Some(next))).await;
                    }
                }

                Err(e)
            }
        }
    }

    /// Cheap reconnect: new signaling channel, existing transports plus an
    /// ICE restart
    async fn resume_connection(self: &Arc<Self>, reason: ReconnectReason) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UnrecoverableState("engine is closed".to_string()));
        }
        // Resuming without transports is an invalid state; the decision
        // tree should have chosen the restart path
        let coordinator = self.coordinator()?;

        let _ = self.emitter.send(EngineEvent::Resuming);
        info!("resuming connection");

        let url = self.url.read().clone();
        let token = self.token.read().clone();
        let sid = self.session_sid.read().clone();

        let payload = self
            .signal
            .reconnect(&url, &token, sid.as_deref(), reason)
            .await?;
        let _ = self.emitter.send(EngineEvent::SignalResumed);

        if let Some(payload) = payload {
            let force_relay = self.options.rtc.force_relay
                || payload
                    .client_configuration
                    .map(|c| c.force_relay)
                    .unwrap_or(false);
            coordinator
                .update_configuration(&payload.ice_servers, force_relay)
                .await?;
        }

        // Reconcile server-side state, then release anything that queued
        // while the channel was down
        let sync_state = self.sync_state(&coordinator).await;
        self.signal.send(SignalRequest::SyncState(sync_state)).await;
        self.signal.flush_queue().await;

        coordinator.trigger_ice_restart().await?;
        coordinator
            .ensure_connected(&self.cancel, self.options.transport_timeout)
            .await?;

        // Channel identity is only assigned once negotiation completes; a
        // resume can lose it
        let recreated = self
            .channels
            .recreate_if_needed(coordinator.publisher().peer_connection())
            .await?;
        if recreated {
            debug!("data channels recreated after resume");
        }

        let _ = self.emitter.send(EngineEvent::Resumed);
        Ok(())
    }

    async fn sync_state(&self, coordinator: &Arc<TransportCoordinator>) -> SyncState {
        let answer = coordinator
            .subscriber()
            .peer_connection()
            .local_description()
            .await
            .map(|desc| SessionDescription::answer(desc.sdp));

        SyncState {
            answer,
            subscription: SubscriptionUpdate {
                track_sids: Vec::new(),
                subscribe: self.options.signal.auto_subscribe,
            },
            publish_cids: self.published_cids.lock().clone(),
            data_channels: self.channels.channel_infos(),
        }
    }

    async fn add_track(self: &Arc<Self>, request: AddTrackRequest) -> Result<TrackInfo> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UnrecoverableState("engine is closed".to_string()));
        }

        let cid = request.cid.clone();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending_publish.lock();
            if pending.contains_key(&cid) {
                return Err(Error::Internal(format!(
                    "track {cid} already has a pending publish"
                )));
            }
            pending.insert(cid.clone(), tx);
        }

        self.signal.send(SignalRequest::AddTrack(request)).await;

        tokio::select! {
            res = rx => match res {
                Ok(info) => {
                    self.published_cids.lock().push(cid);
                    Ok(info)
                }
                // The pending entry was dropped by remove_track or close
                Err(_) => Err(Error::Cancelled(format!("publish of {cid} cancelled"))),
            },
            _ = tokio::time::sleep(self.options.publish_timeout) => {
                self.pending_publish.lock().remove(&cid);
                Err(Error::Timeout(format!(
                    "no acknowledgement for track {cid} within {:?}",
                    self.options.publish_timeout
                )))
            }
        }
    }

    async fn send_data_packet(
        self: &Arc<Self>,
        packet: DataPacket,
        kind: DataPacketKind,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UnrecoverableState("engine is closed".to_string()));
        }

        let data =
            bincode::serialize(&packet).map_err(|e| Error::Serialization(e.to_string()))?;

        if let Err(e) = self.ensure_publisher_ready(kind).await {
            self.escalate_if_needed(&e);
            return Err(e);
        }
        self.channels.send(kind, &data).await
    }

    /// Bring up the publisher transport and the wanted channel, bounded by
    /// the transport timeout
    async fn ensure_publisher_ready(self: &Arc<Self>, kind: DataPacketKind) -> Result<()> {
        let coordinator = self.coordinator()?;
        coordinator.require_publisher(true);

        let deadline = Instant::now() + self.options.transport_timeout;

        if coordinator.publisher().state() == TransportState::New {
            coordinator.negotiate(&self.cancel).await?;
        }

        coordinator
            .ensure_connected(&self.cancel, self.options.transport_timeout)
            .await?;

        // Ride the channel's own open notification for the remaining
        // window rather than polling its state
        let mut open_rx = self.channels.open_signal(kind);
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            biased;
            res = open_rx.wait_for(|open| *open) => match res {
                Ok(_) => Ok(()),
                Err(_) => Err(Error::DataChannel(format!(
                    "{} channel is gone",
                    kind.label()
                ))),
            },
            _ = tokio::time::sleep(remaining) => Err(Error::Timeout(format!(
                "{} channel did not open",
                kind.label()
            ))),
            _ = self.cancel.cancelled() => Err(Error::Cancelled(
                "publisher readiness wait cancelled".to_string(),
            )),
        }
    }

    /// Emit exactly one terminal disconnected event, then close
    async fn terminate(self: &Arc<Self>, reason: String) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        warn!(%reason, "session ended");
        let _ = self.emitter.send(EngineEvent::Disconnected { reason });
        self.close_inner(SessionPhase::Disconnected).await;
    }

    async fn close_inner(self: &Arc<Self>, final_phase: SessionPhase) {
        let _guard = self.close_lock.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("closing engine");
        self.cancel.cancel();

        // Best-effort goodbye before tearing the channel down
        self.signal
            .send(SignalRequest::Leave(Leave {
                action: LeaveAction::Disconnect,
                reason: "client initiated".to_string(),
            }))
            .await;
        self.signal.close(true).await;

        let coordinator = self.coordinator.lock().take();
        if let Some(coordinator) = coordinator {
            coordinator.close().await;
        }
        self.channels.close().await;

        // Dropping the senders rejects any in-flight add_track waits
        self.pending_publish.lock().clear();

        *self.phase.lock() = final_phase;
    }
}
