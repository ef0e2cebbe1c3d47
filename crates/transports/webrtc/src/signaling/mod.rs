//! Websocket signaling client
//!
//! [`SignalClient`] owns one message-channel connection to the session
//! server. It performs the join and reconnect handshakes, sequences and
//! queues outgoing requests across reconnections, and runs the keepalive
//! state machine. Inbound traffic is surfaced through a single typed event
//! stream; the client never calls back into its owner.

mod stream;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use roomlink_core::{
    protocol::types::{JoinPayload, PingRequest, ReconnectPayload},
    SignalRequest, SignalResponse,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::SignalOptions;
use crate::error::{Error, Result};
use crate::reconnect::ReconnectReason;
use crate::sync::CancelToken;

use stream::{SignalStream, StreamEvent};

/// Signal protocol revision sent with every connection
const PROTOCOL_VERSION: &str = "9";

/// Bound on the validate probe used to classify connect failures
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Phase of the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalConnectionState {
    /// A fresh connection attempt is in progress
    Connecting,
    /// The channel is up
    Connected,
    /// A reconnect attempt is in progress; most requests queue
    Reconnecting,
    /// An orderly close is in progress
    Disconnecting,
    /// No channel
    Disconnected,
}

/// Events surfaced to the owner of the client
#[derive(Debug)]
pub enum SignalEvent {
    /// An inbound message that is not part of a handshake or keepalive
    Message(Box<SignalResponse>),
    /// The channel closed unexpectedly, with a reason
    Close(String),
}

/// Receiving half of the signal event stream
pub type SignalEvents = mpsc::UnboundedReceiver<SignalEvent>;

/// A request deferred while the channel reconnects
struct QueuedRequest {
    ordinal: u64,
    request: SignalRequest,
}

struct ActiveConn {
    stream: SignalStream,
    forward_task: JoinHandle<()>,
}

struct KeepaliveHandle {
    ping_task: JoinHandle<()>,
    watchdog_task: JoinHandle<()>,
}

/// Websocket signaling client
pub struct SignalClient {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    options: SignalOptions,
    state: RwLock<SignalConnectionState>,
    conn: Mutex<Option<ActiveConn>>,

    /// Requests deferred during reconnection, drained FIFO
    queue: AsyncMutex<Vec<QueuedRequest>>,
    next_ordinal: AtomicU64,
    /// Serializes queue drains
    drain_lock: AsyncMutex<()>,

    /// At most one join/reconnect attempt at a time
    connect_lock: AsyncMutex<()>,
    /// Serializes the close path
    close_lock: AsyncMutex<()>,

    emitter: mpsc::UnboundedSender<SignalEvent>,

    keepalive: Mutex<Option<KeepaliveHandle>>,
    /// Interval/timeout seconds from the last join payload
    ping_config: Mutex<Option<(u32, u32)>>,
    liveness_deadline: Mutex<Instant>,
    rtt_ms: AtomicI64,
}

impl SignalClient {
    /// Create a client and the event stream its owner consumes
    pub fn new(options: SignalOptions) -> (Self, SignalEvents) {
        let (emitter, events) = mpsc::unbounded_channel();

        let inner = Arc::new(SignalInner {
            options,
            state: RwLock::new(SignalConnectionState::Disconnected),
            conn: Mutex::new(None),
            queue: AsyncMutex::new(Vec::new()),
            next_ordinal: AtomicU64::new(0),
            drain_lock: AsyncMutex::new(()),
            connect_lock: AsyncMutex::new(()),
            close_lock: AsyncMutex::new(()),
            emitter,
            keepalive: Mutex::new(None),
            ping_config: Mutex::new(None),
            liveness_deadline: Mutex::new(Instant::now()),
            rtt_ms: AtomicI64::new(0),
        });

        (Self { inner }, events)
    }

    /// Current channel phase
    pub fn state(&self) -> SignalConnectionState {
        *self.inner.state.read()
    }

    /// Last measured signal round-trip time in milliseconds
    pub fn rtt_ms(&self) -> i64 {
        self.inner.rtt_ms.load(Ordering::Relaxed)
    }

    /// Open a fresh channel and perform the join handshake.
    ///
    /// The connect timeout from the options bounds the socket connect plus
    /// the wait for the first inbound message, which must be a join
    /// payload. On success keepalive timers start if the payload supplied a
    /// positive timeout.
    pub async fn join(
        &self,
        url: &str,
        token: &str,
        cancel: &CancelToken,
    ) -> Result<JoinPayload> {
        let inner = &self.inner;
        let _guard = inner.connect_lock.lock().await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("join attempt already cancelled".to_string()));
        }

        *inner.state.write() = SignalConnectionState::Connecting;

        let request_url = build_signal_url(url, token, &inner.options, None)?;
        debug!(host = ?request_url.host_str(), "connecting signaling channel");

        let (stream, first) = match inner.open_channel(request_url, cancel).await {
            Ok(parts) => parts,
            Err(e) => {
                *inner.state.write() = SignalConnectionState::Disconnected;
                return Err(match e {
                    Error::WebSocket(msg) => classify_connect_failure(url, token, msg).await,
                    other => other,
                });
            }
        };

        let (stream, events) = stream;
        match first {
            StreamEvent::Message(msg) => match *msg {
                SignalResponse::Join(join) => {
                    inner.install_conn(stream, events);
                    *inner.state.write() = SignalConnectionState::Connected;
                    inner.start_keepalive(join.ping_interval, join.ping_timeout);
                    info!(room = %join.room.name, "signaling channel established");
                    Ok(join)
                }
                SignalResponse::Leave(leave) => {
                    stream.close().await;
                    *inner.state.write() = SignalConnectionState::Disconnected;
                    Err(Error::LeaveRequested(leave.reason))
                }
                other => {
                    stream.close().await;
                    *inner.state.write() = SignalConnectionState::Disconnected;
                    Err(Error::Signaling(format!(
                        "expected a join response, got {}",
                        other.kind()
                    )))
                }
            },
            StreamEvent::Closed(reason) => {
                *inner.state.write() = SignalConnectionState::Disconnected;
                Err(Error::ServerUnreachable(format!(
                    "channel closed during join: {reason}"
                )))
            }
        }
    }

    /// Reconnect the channel for an existing session.
    ///
    /// While reconnecting, any inbound message other than a leave is
    /// accepted as proof of success: if it happens to be the explicit
    /// reconnect payload it is returned, otherwise `None` is returned and
    /// the triggering message is dispatched through the normal event
    /// stream. This keeps older servers without an explicit reconnect
    /// acknowledgement working.
    pub async fn reconnect(
        &self,
        url: &str,
        token: &str,
        sid: Option<&str>,
        reason: ReconnectReason,
    ) -> Result<Option<ReconnectPayload>> {
        let inner = &self.inner;
        let _guard = inner.connect_lock.lock().await;

        *inner.state.write() = SignalConnectionState::Reconnecting;
        inner.stop_keepalive();
        inner.teardown_conn().await;

        let request_url = build_signal_url(
            url,
            token,
            &inner.options,
            Some(ReconnectQuery { sid, reason }),
        )?;
        debug!(host = ?request_url.host_str(), reason = reason.as_str(), "reconnecting signaling channel");

        let cancel = CancelToken::new();
        let ((stream, events), first) = inner.open_channel(request_url, &cancel).await?;

        match first {
            StreamEvent::Message(msg) => match *msg {
                SignalResponse::Leave(leave) => {
                    stream.close().await;
                    Err(Error::LeaveRequested(leave.reason))
                }
                SignalResponse::Reconnect(payload) => {
                    inner.install_conn(stream, events);
                    *inner.state.write() = SignalConnectionState::Connected;
                    inner.restart_keepalive();
                    info!("signaling channel resumed");
                    Ok(Some(payload))
                }
                other => {
                    debug!(
                        kind = other.kind(),
                        "no reconnect payload from server, treating traffic as success"
                    );
                    inner.install_conn(stream, events);
                    *inner.state.write() = SignalConnectionState::Connected;
                    inner.restart_keepalive();
                    let _ = inner.emitter.send(SignalEvent::Message(Box::new(other)));
                    Ok(None)
                }
            },
            StreamEvent::Closed(reason) => Err(Error::Signaling(format!(
                "channel closed during reconnect: {reason}"
            ))),
        }
    }

    /// Send a request, queueing it if the channel is reconnecting.
    ///
    /// Fire-and-forget: delivery is not confirmed. Requests that are not
    /// on the reconnect passthrough allow-list are deferred while the
    /// channel reconnects and replayed in submission order afterwards. If
    /// the channel is not open the request is dropped with a logged error.
    pub async fn send(&self, request: SignalRequest) {
        self.inner.send_request(request, false).await
    }

    /// Replay queued requests in FIFO order
    pub async fn flush_queue(&self) {
        self.inner.flush_queue().await
    }

    /// Close the channel.
    ///
    /// Idempotent and serialized; detaches inbound dispatch before closing
    /// the socket so no stale callbacks fire, and always clears keepalive
    /// timers.
    pub async fn close(&self, update_state: bool) {
        let inner = &self.inner;
        let _guard = inner.close_lock.lock().await;

        if update_state {
            *inner.state.write() = SignalConnectionState::Disconnecting;
        }

        inner.stop_keepalive();
        inner.teardown_conn().await;

        if update_state {
            *inner.state.write() = SignalConnectionState::Disconnected;
        }
    }
}

impl SignalInner {
    /// Open the socket and wait for the first inbound event, bounded by the
    /// connect timeout and the cancellation token. The stream is dropped
    /// (tasks aborted) on either failure path.
    async fn open_channel(
        self: &Arc<Self>,
        request_url: Url,
        cancel: &CancelToken,
    ) -> Result<(
        (SignalStream, mpsc::UnboundedReceiver<StreamEvent>),
        StreamEvent,
    )> {
        let attempt = async {
            let (stream, mut events) = SignalStream::connect(request_url).await?;
            match events.recv().await {
                Some(first) => Ok(((stream, events), first)),
                None => Err(Error::WebSocket("channel closed before first message".to_string())),
            }
        };

        tokio::select! {
            res = tokio::time::timeout(self.options.connect_timeout, attempt) => match res {
                Ok(parts) => parts,
                Err(_) => Err(Error::Timeout(format!(
                    "no response within {:?}",
                    self.options.connect_timeout
                ))),
            },
            _ = cancel.cancelled() => Err(Error::Cancelled("connection attempt cancelled".to_string())),
        }
    }

    fn install_conn(
        self: &Arc<Self>,
        stream: SignalStream,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let forward_task = tokio::spawn(Self::forward_loop(Arc::clone(self), events));
        *self.conn.lock() = Some(ActiveConn {
            stream,
            forward_task,
        });
    }

    async fn teardown_conn(&self) {
        let conn = self.conn.lock().take();
        if let Some(active) = conn {
            // Detach dispatch before closing so no stale events fire
            active.forward_task.abort();
            active.stream.close().await;
        }
    }

    /// Pump decoded messages to the owner, tracking liveness and RTT
    async fn forward_loop(
        inner: Arc<SignalInner>,
        mut events: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Message(msg) => {
                    // Any traffic implies liveness
                    inner.touch_liveness();

                    match *msg {
                        SignalResponse::PongResp(pong) => {
                            let rtt = now_ms() - pong.last_ping_timestamp;
                            inner.rtt_ms.store(rtt.max(0), Ordering::Relaxed);
                            debug!(rtt_ms = rtt, "keepalive acknowledged");
                        }
                        // Legacy frame: proves liveness but is not
                        // authoritative for RTT
                        SignalResponse::Pong(_) => {}
                        other => {
                            let _ = inner.emitter.send(SignalEvent::Message(Box::new(other)));
                        }
                    }
                }
                StreamEvent::Closed(reason) => {
                    if *inner.state.read() == SignalConnectionState::Connected {
                        *inner.state.write() = SignalConnectionState::Disconnected;
                        let _ = inner.emitter.send(SignalEvent::Close(reason));
                    }
                    break;
                }
            }
        }
    }

    async fn send_request(self: &Arc<Self>, request: SignalRequest, from_queue: bool) {
        if !from_queue
            && !request.bypasses_queue()
            && *self.state.read() == SignalConnectionState::Reconnecting
        {
            let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
            debug!(
                kind = request.kind(),
                ordinal, "deferring request until reconnected"
            );
            self.queue.lock().await.push(QueuedRequest { ordinal, request });
            return;
        }

        if !from_queue {
            self.flush_queue().await;
        }

        self.write_now(request);
    }

    async fn flush_queue(self: &Arc<Self>) {
        let _guard = self.drain_lock.lock().await;

        let pending: Vec<QueuedRequest> = {
            let mut queue = self.queue.lock().await;
            queue.drain(..).collect()
        };

        if pending.is_empty() {
            return;
        }

        debug!("replaying {} deferred requests", pending.len());
        for queued in pending {
            debug!(
                kind = queued.request.kind(),
                ordinal = queued.ordinal,
                "replaying deferred request"
            );
            self.write_now(queued.request);
        }
    }

    /// Encode and write to the channel if it is open; drop otherwise
    fn write_now(&self, request: SignalRequest) {
        let kind = request.kind();
        let frame = match self.options.encoding.encode_request(&request) {
            Ok(frame) => frame,
            Err(e) => {
                error!(kind, "failed to encode request: {e}");
                return;
            }
        };

        let conn = self.conn.lock();
        match conn.as_ref() {
            Some(active) => {
                if let Err(e) = active.stream.send(frame) {
                    error!(kind, "failed to write request: {e}");
                }
            }
            None => error!(kind, "signaling channel not open, dropping request"),
        }
    }

    fn start_keepalive(self: &Arc<Self>, interval_secs: u32, timeout_secs: u32) {
        self.stop_keepalive();
        *self.ping_config.lock() = Some((interval_secs, timeout_secs));

        if interval_secs == 0 || timeout_secs == 0 {
            debug!("keepalive disabled by server");
            return;
        }

        let timeout = Duration::from_secs(timeout_secs as u64);
        *self.liveness_deadline.lock() = Instant::now() + timeout;

        let ping_inner = Arc::clone(self);
        let ping_task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs as u64));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let request = SignalRequest::PingReq(PingRequest {
                    timestamp: now_ms(),
                    rtt: ping_inner.rtt_ms.load(Ordering::Relaxed),
                });
                ping_inner.send_request(request, false).await;
            }
        });

        let watchdog_inner = Arc::clone(self);
        let watchdog_task = tokio::spawn(async move {
            loop {
                let deadline = *watchdog_inner.liveness_deadline.lock();
                if Instant::now() >= deadline {
                    warn!(
                        timeout_secs,
                        "no liveness signal within the server deadline"
                    );
                    watchdog_inner.on_ping_timeout().await;
                    break;
                }
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            }
        });

        *self.keepalive.lock() = Some(KeepaliveHandle {
            ping_task,
            watchdog_task,
        });
    }

    /// Restart keepalive with the parameters of the last join
    fn restart_keepalive(self: &Arc<Self>) {
        let config = *self.ping_config.lock();
        if let Some((interval, timeout)) = config {
            self.start_keepalive(interval, timeout);
        }
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = self.keepalive.lock().take() {
            handle.ping_task.abort();
            handle.watchdog_task.abort();
        }
    }

    fn touch_liveness(&self) {
        if let Some((_, timeout_secs)) = *self.ping_config.lock() {
            if timeout_secs > 0 {
                *self.liveness_deadline.lock() =
                    Instant::now() + Duration::from_secs(timeout_secs as u64);
            }
        }
    }

    /// Runs inside the watchdog task when the liveness deadline passes
    async fn on_ping_timeout(self: &Arc<Self>) {
        // The watchdog must not abort itself; only stop the ping task
        if let Some(handle) = self.keepalive.lock().take() {
            handle.ping_task.abort();
        }

        self.teardown_conn().await;
        *self.state.write() = SignalConnectionState::Disconnected;
        let _ = self
            .emitter
            .send(SignalEvent::Close("ping timeout".to_string()));
    }
}

struct ReconnectQuery<'a> {
    sid: Option<&'a str>,
    reason: ReconnectReason,
}

/// Build the `<base>/rtc` url with connection parameters as query pairs
fn build_signal_url(
    base: &str,
    token: &str,
    options: &SignalOptions,
    reconnect: Option<ReconnectQuery<'_>>,
) -> Result<Url> {
    let mut url =
        Url::parse(base).map_err(|e| Error::InvalidConfig(format!("invalid url {base:?}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::InvalidConfig(format!(
                "unsupported url scheme: {other}"
            )))
        }
    };
    let _ = url.set_scheme(scheme);

    url.path_segments_mut()
        .map_err(|_| Error::InvalidConfig("url cannot be a base".to_string()))?
        .pop_if_empty()
        .push("rtc");

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("access_token", token);
        query.append_pair("auto_subscribe", bool_flag(options.auto_subscribe));
        query.append_pair("adaptive_stream", bool_flag(options.adaptive_stream));
        query.append_pair("sdk", "rust");
        query.append_pair("os", std::env::consts::OS);
        query.append_pair("protocol", PROTOCOL_VERSION);

        if let Some(network) = &options.network_type {
            query.append_pair("network", network);
        }

        if let Some(reconnect) = reconnect {
            query.append_pair("reconnect", "1");
            if let Some(sid) = reconnect.sid {
                query.append_pair("sid", sid);
            }
            query.append_pair("reconnect_reason", reconnect.reason.as_str());
        }
    }

    Ok(url)
}

fn bool_flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Ask the validate endpoint why an early connect failed.
///
/// A 4xx answer means the server is reachable but rejected us; anything
/// else classifies as unreachable.
async fn classify_connect_failure(base: &str, token: &str, ws_error: String) -> Error {
    let Some(probe_url) = validate_url(base, token) else {
        return Error::ServerUnreachable(ws_error);
    };

    let response = reqwest::Client::new()
        .get(probe_url)
        .timeout(VALIDATE_TIMEOUT)
        .send()
        .await;

    match response {
        Ok(resp) if resp.status().is_client_error() => {
            let body = resp.text().await.unwrap_or_default();
            if body.is_empty() {
                Error::NotAllowed("connection rejected by server".to_string())
            } else {
                Error::NotAllowed(body)
            }
        }
        _ => Error::ServerUnreachable(ws_error),
    }
}

fn validate_url(base: &str, token: &str) -> Option<Url> {
    let mut url = Url::parse(base).ok()?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        _ => return None,
    };
    let _ = url.set_scheme(scheme);
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .extend(["rtc", "validate"]);
    url.query_pairs_mut().append_pair("access_token", token);
    Some(url)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
