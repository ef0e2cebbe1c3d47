//! Wrapper around one peer connection
//!
//! Hides the offer/answer/candidate lifecycle of a single transport and
//! reduces its sub-states into one [`TransportState`] published through a
//! watch channel, so waiters ride state-change notifications instead of
//! polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use roomlink_core::protocol::types::{IceCandidate, SessionDescription, TransportRole};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{Error, Result};
use crate::transport::{TransportEvent, TransportState};

/// ICE configuration applied when a transport (re)negotiates
#[derive(Debug, Clone, Default)]
pub struct IceConfig {
    /// STUN/TURN servers
    pub servers: Vec<RTCIceServer>,
    /// Restrict candidates to relays
    pub force_relay: bool,
}

/// Owns one media transport in the publisher or subscriber role
pub struct TransportLink {
    role: TransportRole,
    pc: Arc<RTCPeerConnection>,

    /// Remote candidates that arrived before a remote description; they
    /// cannot be attached to a transport with no remote description
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,

    /// Updated ICE configuration to apply on the next restart; the
    /// underlying stack cannot mutate servers on a live connection
    pending_config: Mutex<Option<IceConfig>>,

    restarting_ice: AtomicBool,
    closed: Arc<AtomicBool>,

    state_tx: Arc<watch::Sender<TransportState>>,
    /// Signalled whenever a remote answer is applied, which is what marks
    /// a publisher negotiation round trip as complete
    negotiated: Arc<Notify>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportLink {
    /// Create the transport and install its state/candidate handlers
    pub async fn new(
        role: TransportRole,
        config: IceConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("failed to register codecs: {e}")))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine)
                .map_err(|e| Error::WebRtc(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.servers,
            ice_transport_policy: if config.force_relay {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::WebRtc(format!("failed to create peer connection: {e}")))?,
        );

        let (state_tx, _state_rx) = watch::channel(TransportState::New);
        let state_tx = Arc::new(state_tx);
        let closed = Arc::new(AtomicBool::new(false));

        let link = Self {
            role,
            pc: Arc::clone(&pc),
            pending_candidates: Mutex::new(Vec::new()),
            pending_config: Mutex::new(None),
            restarting_ice: AtomicBool::new(false),
            closed: Arc::clone(&closed),
            state_tx: Arc::clone(&state_tx),
            negotiated: Arc::new(Notify::new()),
            events: events.clone(),
        };

        link.install_handlers(&pc, state_tx, closed, events);
        info!(?role, "transport created");
        Ok(link)
    }

    fn install_handlers(
        &self,
        pc: &Arc<RTCPeerConnection>,
        state_tx: Arc<watch::Sender<TransportState>>,
        closed: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let role = self.role;

        let candidate_events = events.clone();
        let candidate_closed = Arc::clone(&closed);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            let closed = Arc::clone(&candidate_closed);
            Box::pin(async move {
                if closed.load(Ordering::Acquire) {
                    return;
                }
                let Some(candidate) = candidate else {
                    debug!(?role, "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate {
                            role,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                            },
                        });
                    }
                    Err(e) => warn!(?role, "could not serialize local candidate: {e}"),
                }
            })
        }));

        let state_events = events.clone();
        let state_closed = Arc::clone(&closed);
        pc.on_peer_connection_state_change(Box::new(move |pc_state: RTCPeerConnectionState| {
            let state_tx = Arc::clone(&state_tx);
            let events = state_events.clone();
            let closed = Arc::clone(&state_closed);
            Box::pin(async move {
                if closed.load(Ordering::Acquire) {
                    return;
                }
                let Some(new_state) = reduce_state(pc_state) else {
                    return;
                };
                let changed = state_tx.send_if_modified(|current| {
                    if *current != new_state {
                        debug!(?role, "transport state {:?} -> {:?}", *current, new_state);
                        *current = new_state;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    let _ = events.send(TransportEvent::StateChange {
                        role,
                        state: new_state,
                    });
                }
            })
        }));

        pc.on_ice_connection_state_change(Box::new(move |ice_state| {
            Box::pin(async move {
                debug!(?role, "ICE connection state: {ice_state}");
            })
        }));

        let dc_events = events.clone();
        pc.on_data_channel(Box::new(move |channel| {
            let events = dc_events.clone();
            Box::pin(async move {
                debug!(?role, label = channel.label(), "remote data channel");
                let _ = events.send(TransportEvent::DataChannel { role, channel });
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track, receiver, transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::Track {
                    role,
                    track,
                    receiver,
                    transceiver,
                });
            })
        }));
    }

    /// Role this link plays
    pub fn role(&self) -> TransportRole {
        self.role
    }

    /// Current reduced state
    pub fn state(&self) -> TransportState {
        *self.state_tx.borrow()
    }

    /// Subscribe to reduced state changes
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    /// Notify handle signalled when a remote answer is applied
    pub fn negotiation_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.negotiated)
    }

    /// The underlying peer connection (data channel creation, stats)
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Trigger negotiation and emit the resulting offer.
    ///
    /// With `ice_restart` the offer forces a fresh ICE negotiation, which
    /// also applies any pending configuration update.
    pub async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UnrecoverableState("transport is closed".to_string()));
        }

        if ice_restart {
            self.restarting_ice.store(true, Ordering::Release);
            if let Some(config) = self.pending_config.lock().await.take() {
                // Applies with the fresh negotiation; live reconfiguration
                // is not supported by the stack
                debug!(role = ?self.role, servers = config.servers.len(), "ICE configuration refreshed for restart");
            }
        }

        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };

        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| Error::Negotiation(format!("failed to create offer: {e}")))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| Error::Negotiation(format!("failed to set local offer: {e}")))?;

        let description = SessionDescription::offer(offer.sdp);
        let _ = self.events.send(TransportEvent::LocalOffer {
            role: self.role,
            description: description.clone(),
        });

        debug!(role = ?self.role, ice_restart, "created local offer");
        Ok(description)
    }

    /// Apply a remote answer to a previously sent offer
    pub async fn set_remote_answer(&self, answer: SessionDescription) -> Result<()> {
        let remote = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| Error::Negotiation(format!("invalid answer SDP: {e}")))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::Negotiation(format!("failed to apply answer: {e}")))?;

        self.flush_pending_candidates().await;
        self.restarting_ice.store(false, Ordering::Release);

        // Resolves waiters in negotiate(): the round trip is complete only
        // now, not when the offer was requested
        self.negotiated.notify_waiters();
        Ok(())
    }

    /// Apply a remote offer and return the local answer (subscriber role)
    pub async fn create_answer_from_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UnrecoverableState("transport is closed".to_string()));
        }

        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| Error::Negotiation(format!("invalid offer SDP: {e}")))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::Negotiation(format!("failed to apply offer: {e}")))?;

        self.flush_pending_candidates().await;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("failed to create answer: {e}")))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| Error::Negotiation(format!("failed to set local answer: {e}")))?;

        debug!(role = ?self.role, "created local answer");
        Ok(SessionDescription::answer(answer.sdp))
    }

    /// Add a remote ICE candidate, buffering it until a remote description
    /// has been applied
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };

        if self.pc.remote_description().await.is_none() {
            debug!(role = ?self.role, "buffering remote candidate until a remote description exists");
            self.pending_candidates.lock().await.push(init);
            return Ok(());
        }

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::WebRtc(format!("failed to add remote candidate: {e}")))
    }

    async fn flush_pending_candidates(&self) {
        let pending: Vec<RTCIceCandidateInit> = {
            let mut buffer = self.pending_candidates.lock().await;
            buffer.drain(..).collect()
        };

        if pending.is_empty() {
            return;
        }

        debug!(role = ?self.role, "flushing {} buffered candidates", pending.len());
        for init in pending {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(role = ?self.role, "failed to add buffered candidate: {e}");
            }
        }
    }

    /// Stage an updated ICE server list / relay policy and optionally
    /// force a fresh ICE negotiation to carry it
    pub async fn set_configuration(&self, config: IceConfig, ice_restart: bool) -> Result<()> {
        *self.pending_config.lock().await = Some(config);
        if ice_restart {
            self.create_offer(true).await?;
        }
        Ok(())
    }

    /// Mark the transport so its next negotiation restarts ICE
    pub fn prepare_ice_restart(&self) {
        self.restarting_ice.store(true, Ordering::Release);
    }

    /// Whether an ICE restart has been requested and not yet completed
    pub fn is_restarting_ice(&self) -> bool {
        self.restarting_ice.load(Ordering::Acquire)
    }

    /// Address of the selected remote candidate, when connected
    pub async fn selected_candidate_address(&self) -> Option<String> {
        let sctp = self.pc.sctp();
        let dtls = sctp.transport();
        let ice = dtls.ice_transport();
        ice.get_selected_candidate_pair()
            .await
            .map(|pair| format!("{}:{}", pair.remote.address, pair.remote.port))
    }

    /// Close the transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.state_tx.send_replace(TransportState::Closing);
        if let Err(e) = self.pc.close().await {
            warn!(role = ?self.role, "error closing peer connection: {e}");
        }
        self.state_tx.send_replace(TransportState::Closed);
        info!(role = ?self.role, "transport closed");
    }
}

/// Reduce the connection-level state into the transport state; `None`
/// leaves the current reduced state untouched
fn reduce_state(pc_state: RTCPeerConnectionState) -> Option<TransportState> {
    match pc_state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        // Disconnected is transient at the ICE layer and may recover
        RTCPeerConnectionState::Disconnected => Some(TransportState::Connecting),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}
