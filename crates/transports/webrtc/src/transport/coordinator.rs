//! Coordination of the publisher/subscriber transport pair
//!
//! Decides which transports are required (a server flag makes the
//! subscriber or publisher side primary and thus always required) and
//! reduces the pair's individual states into one aggregate connection
//! state, recomputed on every child transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roomlink_core::protocol::types::{IceServerInfo, TransportRole};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{Error, Result};
use crate::sync::CancelToken;
use crate::transport::link::{IceConfig, TransportLink};
use crate::transport::{TransportEvent, TransportState};

/// Owns the publisher and subscriber transports and their aggregate state
pub struct TransportCoordinator {
    publisher: Arc<TransportLink>,
    subscriber: Arc<TransportLink>,

    publisher_required: Arc<AtomicBool>,
    subscriber_required: Arc<AtomicBool>,
    requirements_changed: Arc<Notify>,
    subscriber_primary: bool,

    aggregate_tx: Arc<watch::Sender<TransportState>>,
    monitor_task: JoinHandle<()>,

    /// Prevents two overlapping connection-establishment attempts
    connect_lock: AsyncMutex<()>,
    negotiation_timeout: Duration,
    closed: AtomicBool,
}

impl TransportCoordinator {
    /// Create both transports.
    ///
    /// The primary side (decided by `subscriber_primary`) is marked
    /// required immediately; the other side becomes required once it is
    /// actually used.
    pub async fn new(
        subscriber_primary: bool,
        ice: IceConfig,
        negotiation_timeout: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self> {
        let publisher = Arc::new(
            TransportLink::new(TransportRole::Publisher, ice.clone(), events.clone()).await?,
        );
        let subscriber =
            Arc::new(TransportLink::new(TransportRole::Subscriber, ice, events).await?);

        let publisher_required = Arc::new(AtomicBool::new(!subscriber_primary));
        let subscriber_required = Arc::new(AtomicBool::new(subscriber_primary));
        let requirements_changed = Arc::new(Notify::new());

        let (aggregate_tx, _) = watch::channel(TransportState::New);
        let aggregate_tx = Arc::new(aggregate_tx);

        let monitor_task = tokio::spawn(Self::monitor_loop(
            publisher.subscribe(),
            subscriber.subscribe(),
            Arc::clone(&publisher_required),
            Arc::clone(&subscriber_required),
            Arc::clone(&requirements_changed),
            Arc::clone(&aggregate_tx),
        ));

        info!(subscriber_primary, "transport coordinator ready");

        Ok(Self {
            publisher,
            subscriber,
            publisher_required,
            subscriber_required,
            requirements_changed,
            subscriber_primary,
            aggregate_tx,
            monitor_task,
            connect_lock: AsyncMutex::new(()),
            negotiation_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Recompute the aggregate on every child transition or requirement
    /// change
    async fn monitor_loop(
        mut publisher_rx: watch::Receiver<TransportState>,
        mut subscriber_rx: watch::Receiver<TransportState>,
        publisher_required: Arc<AtomicBool>,
        subscriber_required: Arc<AtomicBool>,
        requirements_changed: Arc<Notify>,
        aggregate_tx: Arc<watch::Sender<TransportState>>,
    ) {
        loop {
            let mut states = Vec::with_capacity(2);
            if publisher_required.load(Ordering::Acquire) {
                states.push(*publisher_rx.borrow());
            }
            if subscriber_required.load(Ordering::Acquire) {
                states.push(*subscriber_rx.borrow());
            }

            let aggregate = reduce_aggregate(&states);
            aggregate_tx.send_if_modified(|current| {
                if *current != aggregate {
                    debug!("aggregate transport state {:?} -> {:?}", *current, aggregate);
                    *current = aggregate;
                    true
                } else {
                    false
                }
            });

            tokio::select! {
                changed = publisher_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = subscriber_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = requirements_changed.notified() => {}
            }
        }

        debug!("coordinator monitor terminated");
    }

    /// Whether the subscriber side is primary for this session
    pub fn subscriber_primary(&self) -> bool {
        self.subscriber_primary
    }

    /// Toggle whether the publisher counts toward the aggregate
    pub fn require_publisher(&self, required: bool) {
        self.publisher_required.store(required, Ordering::Release);
        self.requirements_changed.notify_one();
    }

    /// Toggle whether the subscriber counts toward the aggregate
    pub fn require_subscriber(&self, required: bool) {
        self.subscriber_required.store(required, Ordering::Release);
        self.requirements_changed.notify_one();
    }

    /// Whether the publisher currently counts toward the aggregate
    pub fn publisher_required(&self) -> bool {
        self.publisher_required.load(Ordering::Acquire)
    }

    /// Current aggregate state
    pub fn aggregate_state(&self) -> TransportState {
        *self.aggregate_tx.borrow()
    }

    /// Subscribe to aggregate state changes
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.aggregate_tx.subscribe()
    }

    /// The publisher transport
    pub fn publisher(&self) -> &Arc<TransportLink> {
        &self.publisher
    }

    /// The subscriber transport
    pub fn subscriber(&self) -> &Arc<TransportLink> {
        &self.subscriber
    }

    /// Transport for a signaling target role
    pub fn link(&self, role: TransportRole) -> &Arc<TransportLink> {
        match role {
            TransportRole::Publisher => &self.publisher,
            TransportRole::Subscriber => &self.subscriber,
        }
    }

    /// Address of the selected remote candidate for the given role.
    ///
    /// Role-qualified on purpose: each role queries its own transport.
    pub async fn selected_address(&self, role: TransportRole) -> Option<String> {
        self.link(role).selected_candidate_address().await
    }

    /// Drive the aggregate to connected, bounded and cancellable.
    ///
    /// If the publisher is required and still idle this triggers a
    /// negotiation first. Serialized so two callers cannot race two
    /// connection-establishment attempts.
    pub async fn ensure_connected(&self, cancel: &CancelToken, timeout: Duration) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UnrecoverableState(
                "coordinator is closed".to_string(),
            ));
        }

        if self.publisher_required() && self.publisher.state() == TransportState::New {
            self.negotiate(cancel).await?;
        }

        let mut rx = self.aggregate_tx.subscribe();
        tokio::select! {
            res = rx.wait_for(|state| {
                matches!(state, TransportState::Connected | TransportState::Failed)
            }) => match res {
                Ok(state) if *state == TransportState::Connected => Ok(()),
                Ok(_) => Err(Error::Internal("a required transport failed".to_string())),
                Err(_) => Err(Error::UnrecoverableState("coordinator torn down".to_string())),
            },
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout(
                "waiting for transport connection".to_string(),
            )),
            _ = cancel.cancelled() => Err(Error::Cancelled(
                "transport connection wait cancelled".to_string(),
            )),
        }
    }

    /// One publisher SDP round trip in its own timeout window.
    ///
    /// Resolves only when the remote answer has been applied, not merely
    /// when the offer was requested.
    pub async fn negotiate(&self, cancel: &CancelToken) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UnrecoverableState(
                "coordinator is closed".to_string(),
            ));
        }

        let signal = self.publisher.negotiation_signal();
        let notified = signal.notified();
        tokio::pin!(notified);
        // Register before the offer goes out so the answer cannot slip by
        notified.as_mut().enable();

        self.publisher.create_offer(false).await?;

        tokio::select! {
            _ = notified => {
                debug!("publisher negotiation complete");
                Ok(())
            }
            _ = tokio::time::sleep(self.negotiation_timeout) => Err(Error::Negotiation(
                "timed out waiting for the publisher answer".to_string(),
            )),
            _ = cancel.cancelled() => Err(Error::Cancelled("negotiation cancelled".to_string())),
        }
    }

    /// Restart ICE on both transports; the mechanism behind resume
    /// reconnection.
    ///
    /// The subscriber is marked for restart (the server re-offers it);
    /// only a required publisher issues a fresh ICE-restart offer.
    pub async fn trigger_ice_restart(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UnrecoverableState(
                "coordinator is closed".to_string(),
            ));
        }

        self.subscriber.prepare_ice_restart();

        if self.publisher_required() {
            self.publisher.create_offer(true).await?;
        }

        Ok(())
    }

    /// Push an updated ICE configuration into both transports; it takes
    /// effect on their next (restart) negotiation
    pub async fn update_configuration(
        &self,
        ice_servers: &[IceServerInfo],
        force_relay: bool,
    ) -> Result<()> {
        let config = IceConfig {
            servers: to_rtc_ice_servers(ice_servers),
            force_relay,
        };

        self.publisher
            .set_configuration(config.clone(), false)
            .await?;
        self.subscriber.set_configuration(config, false).await?;
        Ok(())
    }

    /// Close both transports. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.publisher.close().await;
        self.subscriber.close().await;
        self.monitor_task.abort();
        info!("transport coordinator closed");
    }
}

impl Drop for TransportCoordinator {
    fn drop(&mut self) {
        self.monitor_task.abort();
    }
}

/// Convert server-supplied ICE entries to the stack's representation
pub(crate) fn to_rtc_ice_servers(servers: &[IceServerInfo]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

/// Reduce the required transports' states into the aggregate.
///
/// Precedence: all connected wins, then any failure, then fully closed,
/// then partially closed, then untouched, else connecting.
pub(crate) fn reduce_aggregate(states: &[TransportState]) -> TransportState {
    if states.is_empty() {
        return TransportState::New;
    }

    if states.iter().all(|s| *s == TransportState::Connected) {
        TransportState::Connected
    } else if states.iter().any(|s| *s == TransportState::Failed) {
        TransportState::Failed
    } else if states.iter().all(|s| *s == TransportState::Closed) {
        TransportState::Closed
    } else if states
        .iter()
        .any(|s| matches!(s, TransportState::Closed | TransportState::Closing))
    {
        TransportState::Closing
    } else if states.iter().all(|s| *s == TransportState::New) {
        TransportState::New
    } else {
        TransportState::Connecting
    }
}
