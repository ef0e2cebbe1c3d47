//! In-process signal server for integration testing
//!
//! Speaks the wire protocol over a real websocket listener. With media
//! enabled it also stands up server-side peer connections and negotiates
//! them against the client under test, so transports genuinely reach
//! connected over loopback.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use roomlink_core::protocol::codec;
use roomlink_core::protocol::types::*;
use roomlink_core::{Encoding, SignalRequest, SignalResponse, WireFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Behavior knobs for one mock server instance
#[derive(Default, Clone)]
pub struct ServerConfig {
    /// Join payload sent as the first message on fresh connections
    pub join: Option<JoinPayload>,
    /// Overrides the join payload as the first message, when set
    pub first_response: Option<SignalResponse>,
    /// Explicit acknowledgement sent on reconnect connections
    pub reconnect_payload: Option<ReconnectPayload>,
    /// Sent on reconnect connections instead of an explicit
    /// acknowledgement (legacy-server mode)
    pub legacy_reconnect_response: Option<SignalResponse>,
    /// Pause before answering a reconnect connection
    pub reconnect_delay: Option<Duration>,
    /// Answer keepalive frames
    pub answer_pings: bool,
    /// Accept connections but never send anything
    pub silent: bool,
    /// Negotiate real server-side peer connections
    pub media: bool,
}

/// Server-side peer connections negotiated against the client under test
pub struct MediaPeer {
    /// Server end of the client's subscriber transport
    pub subscriber_pc: Arc<RTCPeerConnection>,
    /// Server end of the client's publisher transport
    pub publisher_pc: Arc<RTCPeerConnection>,
    /// Reliable channel toward the client
    pub reliable_dc: Arc<RTCDataChannel>,
    /// Lossy channel toward the client
    pub lossy_dc: Arc<RTCDataChannel>,
    /// Raw payloads received from the client's publisher channels
    pub received_data: Arc<Mutex<Vec<Vec<u8>>>>,
}

struct ServerState {
    config: ServerConfig,
    requests: Mutex<Vec<SignalRequest>>,
    queries: Mutex<Vec<String>>,
    connections: AtomicUsize,
    outbound: Mutex<Option<mpsc::UnboundedSender<SignalResponse>>>,
    drop_signal: Mutex<Option<mpsc::UnboundedSender<()>>>,
    media: Mutex<Option<Arc<MediaPeer>>>,
}

/// One in-process signal server bound to an ephemeral loopback port
pub struct MockSignalServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    listener_task: tokio::task::JoinHandle<()>,
}

/// Opt-in test logging via RUST_LOG
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

impl MockSignalServer {
    pub async fn spawn(config: ServerConfig) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(ServerState {
            config,
            requests: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            outbound: Mutex::new(None),
            drop_signal: Mutex::new(None),
            media: Mutex::new(None),
        });

        let accept_state = Arc::clone(&state);
        let listener_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(stream, Arc::clone(&accept_state)));
            }
        });

        Self {
            addr,
            state,
            listener_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SignalRequest> {
        self.state.requests.lock().clone()
    }

    /// Raw query string of each accepted connection, in order
    pub fn queries(&self) -> Vec<String> {
        self.state.queries.lock().clone()
    }

    /// Push a response to the most recent connection
    pub fn send(&self, response: SignalResponse) {
        if let Some(tx) = self.state.outbound.lock().as_ref() {
            let _ = tx.send(response);
        }
    }

    /// Sever the most recent connection without a close handshake
    pub fn drop_connection(&self) {
        if let Some(tx) = self.state.drop_signal.lock().as_ref() {
            let _ = tx.send(());
        }
    }

    /// Stop accepting and sever the current connection
    pub fn shutdown(&self) {
        self.listener_task.abort();
        self.drop_connection();
    }

    /// Server-side media peer of the latest fresh connection
    pub fn media_peer(&self) -> Option<Arc<MediaPeer>> {
        self.state.media.lock().clone()
    }

    /// Wait until a recorded request satisfies the predicate
    pub async fn wait_for_request<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&SignalRequest) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.requests().iter().any(&predicate) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for MockSignalServer {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let mut query = String::new();
    let ws = match accept_hdr_async(stream, |req: &Request, resp: Response| {
        query = req.uri().query().unwrap_or("").to_string();
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(_) => return,
    };

    let is_reconnect = query.contains("reconnect=1");
    state.queries.lock().push(query);
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalResponse>();
    *state.outbound.lock() = Some(out_tx.clone());
    let (drop_tx, mut drop_rx) = mpsc::unbounded_channel::<()>();
    *state.drop_signal.lock() = Some(drop_tx);

    if !state.config.silent {
        if is_reconnect {
            if let Some(delay) = state.config.reconnect_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(payload) = &state.config.reconnect_payload {
                send_response(&mut ws_tx, &SignalResponse::Reconnect(payload.clone())).await;
            } else if let Some(response) = &state.config.legacy_reconnect_response {
                send_response(&mut ws_tx, response).await;
            }
        } else if let Some(response) = &state.config.first_response {
            send_response(&mut ws_tx, response).await;
        } else if let Some(join) = &state.config.join {
            send_response(&mut ws_tx, &SignalResponse::Join(join.clone())).await;

            if state.config.media {
                let peer = Arc::new(MediaPeer::new(out_tx.clone()).await);
                *state.media.lock() = Some(Arc::clone(&peer));
                peer.send_subscriber_offer(out_tx.clone()).await;
            }
        }
    }

    loop {
        tokio::select! {
            message = ws_rx.next() => {
                let Some(Ok(message)) = message else { break };
                let frame = match message {
                    Message::Binary(bytes) => WireFrame::Binary(bytes),
                    Message::Text(text) => WireFrame::Text(text),
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(request) = codec::decode_request(&frame) else { continue };

                let reply = match &request {
                    SignalRequest::PingReq(ping) if state.config.answer_pings => {
                        Some(SignalResponse::PongResp(PongResponse {
                            last_ping_timestamp: ping.timestamp,
                            timestamp: ping.timestamp,
                        }))
                    }
                    SignalRequest::Ping(ts) if state.config.answer_pings => {
                        Some(SignalResponse::Pong(*ts))
                    }
                    _ => None,
                };

                let media = state.media.lock().clone();
                if let Some(peer) = media {
                    peer.handle_request(&request, &out_tx).await;
                }

                state.requests.lock().push(request);
                if let Some(reply) = reply {
                    send_response(&mut ws_tx, &reply).await;
                }
            }
            response = out_rx.recv() => {
                let Some(response) = response else { break };
                send_response(&mut ws_tx, &response).await;
            }
            _ = drop_rx.recv() => break,
        }
    }
}

async fn send_response(ws_tx: &mut WsSink, response: &SignalResponse) {
    let frame = Encoding::Binary.encode_response(response).unwrap();
    let message = match frame {
        WireFrame::Binary(bytes) => Message::Binary(bytes),
        WireFrame::Text(text) => Message::Text(text),
    };
    let _ = ws_tx.send(message).await;
}

async fn new_peer_connection() -> Arc<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let registry = register_default_interceptors(Default::default(), &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap(),
    )
}

impl MediaPeer {
    async fn new(out_tx: mpsc::UnboundedSender<SignalResponse>) -> Self {
        let subscriber_pc = new_peer_connection().await;
        let publisher_pc = new_peer_connection().await;

        let reliable_dc = subscriber_pc
            .create_data_channel(
                "_reliable",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        let lossy_dc = subscriber_pc
            .create_data_channel(
                "_lossy",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    max_retransmits: Some(0),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        Self::forward_candidates(&subscriber_pc, TransportRole::Subscriber, out_tx.clone());
        Self::forward_candidates(&publisher_pc, TransportRole::Publisher, out_tx);

        let received_data: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received_data);
        publisher_pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                let sink = Arc::clone(&sink);
                channel.on_message(Box::new(move |message| {
                    let sink = Arc::clone(&sink);
                    Box::pin(async move {
                        sink.lock().push(message.data.to_vec());
                    })
                }));
            })
        }));

        Self {
            subscriber_pc,
            publisher_pc,
            reliable_dc,
            lossy_dc,
            received_data,
        }
    }

    fn forward_candidates(
        pc: &Arc<RTCPeerConnection>,
        target: TransportRole,
        out_tx: mpsc::UnboundedSender<SignalResponse>,
    ) {
        pc.on_ice_candidate(Box::new(move |candidate| {
            let out_tx = out_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else { return };
                let _ = out_tx.send(SignalResponse::Trickle(Trickle {
                    target,
                    candidate: IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    },
                }));
            })
        }));
    }

    async fn send_subscriber_offer(&self, out_tx: mpsc::UnboundedSender<SignalResponse>) {
        let offer = self.subscriber_pc.create_offer(None).await.unwrap();
        self.subscriber_pc
            .set_local_description(offer.clone())
            .await
            .unwrap();
        let _ = out_tx.send(SignalResponse::Offer(SessionDescription::offer(offer.sdp)));
    }

    async fn handle_request(
        &self,
        request: &SignalRequest,
        out_tx: &mpsc::UnboundedSender<SignalResponse>,
    ) {
        match request {
            SignalRequest::Answer(answer) => {
                let desc = RTCSessionDescription::answer(answer.sdp.clone()).unwrap();
                let _ = self.subscriber_pc.set_remote_description(desc).await;
            }
            SignalRequest::Offer(offer) => {
                let desc = RTCSessionDescription::offer(offer.sdp.clone()).unwrap();
                if self.publisher_pc.set_remote_description(desc).await.is_ok() {
                    let answer = self.publisher_pc.create_answer(None).await.unwrap();
                    self.publisher_pc
                        .set_local_description(answer.clone())
                        .await
                        .unwrap();
                    let _ = out_tx.send(SignalResponse::Answer(SessionDescription::answer(
                        answer.sdp,
                    )));
                }
            }
            SignalRequest::Trickle(trickle) => {
                let init = RTCIceCandidateInit {
                    candidate: trickle.candidate.candidate.clone(),
                    sdp_mid: trickle.candidate.sdp_mid.clone(),
                    sdp_mline_index: trickle.candidate.sdp_m_line_index,
                    username_fragment: None,
                };
                let pc = match trickle.target {
                    TransportRole::Subscriber => &self.subscriber_pc,
                    TransportRole::Publisher => &self.publisher_pc,
                };
                let _ = pc.add_ice_candidate(init).await;
            }
            _ => {}
        }
    }

    /// Send bytes to the client on the reliable subscriber channel once it
    /// opens
    pub async fn send_reliable(&self, data: Vec<u8>) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.reliable_dc.ready_state() != RTCDataChannelState::Open {
            assert!(
                tokio::time::Instant::now() < deadline,
                "reliable channel never opened"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.reliable_dc
            .send(&bytes::Bytes::from(data))
            .await
            .unwrap();
    }
}

/// Minimal join payload for tests
pub fn test_join(subscriber_primary: bool, ping_interval: u32, ping_timeout: u32) -> JoinPayload {
    JoinPayload {
        room: RoomInfo {
            sid: "RM_test".to_string(),
            name: "test-room".to_string(),
            metadata: String::new(),
        },
        participant: ParticipantInfo {
            sid: "PA_local".to_string(),
            identity: "local".to_string(),
            name: "Local".to_string(),
            metadata: String::new(),
            tracks: vec![],
        },
        other_participants: vec![],
        server_version: "0.0.0-test".to_string(),
        subscriber_primary,
        ice_servers: vec![],
        client_configuration: None,
        ping_interval,
        ping_timeout,
        fast_publish: true,
    }
}

/// A participant snapshot for roster updates
pub fn test_participant(sid: &str) -> ParticipantInfo {
    ParticipantInfo {
        sid: sid.to_string(),
        identity: format!("identity-{sid}"),
        name: sid.to_string(),
        metadata: String::new(),
        tracks: vec![],
    }
}
