//! Data channel management
//!
//! Two fixed logical channels ride the publisher transport: "lossy"
//! (ordered, zero retransmissions) and "reliable" (ordered, fully
//! reliable). The subscriber transport receives mirror channels from the
//! server. A buffered-amount-low threshold produces a per-kind boolean
//! backpressure signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use roomlink_core::protocol::types::{DataChannelInfo, DataPacket};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

use crate::engine::EngineEvent;
use crate::error::{Error, Result};

/// Label of the lossy channel
pub const LOSSY_LABEL: &str = "_lossy";
/// Label of the reliable channel
pub const RELIABLE_LABEL: &str = "_reliable";

/// Buffered bytes above which a channel reports backpressure
pub const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 64 * 1024;

/// Delivery class of an outgoing data packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataPacketKind {
    /// Best-effort: ordered, no retransmissions
    Lossy,
    /// Fully reliable, ordered
    Reliable,
}

impl DataPacketKind {
    /// Channel label used for this kind
    pub fn label(&self) -> &'static str {
        match self {
            DataPacketKind::Lossy => LOSSY_LABEL,
            DataPacketKind::Reliable => RELIABLE_LABEL,
        }
    }
}

/// The publisher-side channel pair plus the subscriber-side mirrors
pub(crate) struct DataChannelSet {
    lossy: Mutex<Option<Arc<RTCDataChannel>>>,
    reliable: Mutex<Option<Arc<RTCDataChannel>>>,
    sub_lossy: Mutex<Option<Arc<RTCDataChannel>>>,
    sub_reliable: Mutex<Option<Arc<RTCDataChannel>>>,

    lossy_low: Arc<AtomicBool>,
    reliable_low: Arc<AtomicBool>,

    /// Per-kind open state of the publisher channels; waiters ride the
    /// channel's own open notification instead of polling
    lossy_open: Arc<watch::Sender<bool>>,
    reliable_open: Arc<watch::Sender<bool>>,

    emitter: mpsc::UnboundedSender<EngineEvent>,
}

impl DataChannelSet {
    pub(crate) fn new(emitter: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let (lossy_open, _) = watch::channel(false);
        let (reliable_open, _) = watch::channel(false);

        Self {
            lossy: Mutex::new(None),
            reliable: Mutex::new(None),
            sub_lossy: Mutex::new(None),
            sub_reliable: Mutex::new(None),
            lossy_low: Arc::new(AtomicBool::new(true)),
            reliable_low: Arc::new(AtomicBool::new(true)),
            lossy_open: Arc::new(lossy_open),
            reliable_open: Arc::new(reliable_open),
            emitter,
        }
    }

    /// Create both logical channels on the publisher transport
    pub(crate) async fn create_publisher_channels(
        &self,
        pc: &Arc<RTCPeerConnection>,
    ) -> Result<()> {
        let lossy = pc
            .create_data_channel(
                LOSSY_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    max_retransmits: Some(0),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::DataChannel(format!("failed to create lossy channel: {e}")))?;

        let reliable = pc
            .create_data_channel(
                RELIABLE_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::DataChannel(format!("failed to create reliable channel: {e}")))?;

        self.install_buffer_watch(&lossy, DataPacketKind::Lossy)
            .await;
        self.install_buffer_watch(&reliable, DataPacketKind::Reliable)
            .await;
        self.install_open_watch(&lossy, DataPacketKind::Lossy);
        self.install_open_watch(&reliable, DataPacketKind::Reliable);

        *self.lossy.lock() = Some(lossy);
        *self.reliable.lock() = Some(reliable);
        self.lossy_low.store(true, Ordering::Release);
        self.reliable_low.store(true, Ordering::Release);

        debug!("publisher data channels created");
        Ok(())
    }

    async fn install_buffer_watch(&self, channel: &Arc<RTCDataChannel>, kind: DataPacketKind) {
        channel
            .set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
            .await;

        let flag = self.low_flag(kind);
        let emitter = self.emitter.clone();
        channel
            .on_buffered_amount_low(Box::new(move || {
                let flag = Arc::clone(&flag);
                let emitter = emitter.clone();
                Box::pin(async move {
                    if !flag.swap(true, Ordering::AcqRel) {
                        let _ = emitter
                            .send(EngineEvent::DataChannelBufferStatus { kind, low: true });
                    }
                })
            }))
            .await;
    }

    /// Track the channel's open state through its own lifecycle handlers
    fn install_open_watch(&self, channel: &Arc<RTCDataChannel>, kind: DataPacketKind) {
        let open_tx = self.open_flag(kind);
        open_tx.send_replace(false);

        let opened = Arc::clone(&open_tx);
        channel.on_open(Box::new(move || {
            let opened = Arc::clone(&opened);
            Box::pin(async move {
                opened.send_replace(true);
            })
        }));

        let closed = Arc::clone(&open_tx);
        channel.on_close(Box::new(move || {
            let closed = Arc::clone(&closed);
            Box::pin(async move {
                closed.send_replace(false);
            })
        }));

        // The channel may have opened before the handler landed
        if channel.ready_state() == RTCDataChannelState::Open {
            open_tx.send_replace(true);
        }
    }

    fn open_flag(&self, kind: DataPacketKind) -> Arc<watch::Sender<bool>> {
        match kind {
            DataPacketKind::Lossy => Arc::clone(&self.lossy_open),
            DataPacketKind::Reliable => Arc::clone(&self.reliable_open),
        }
    }

    /// Subscribe to the open state of the publisher channel of this kind
    pub(crate) fn open_signal(&self, kind: DataPacketKind) -> watch::Receiver<bool> {
        self.open_flag(kind).subscribe()
    }

    fn low_flag(&self, kind: DataPacketKind) -> Arc<AtomicBool> {
        match kind {
            DataPacketKind::Lossy => Arc::clone(&self.lossy_low),
            DataPacketKind::Reliable => Arc::clone(&self.reliable_low),
        }
    }

    /// Whether the channel's send buffer is below the backpressure
    /// threshold
    pub(crate) fn is_buffer_low(&self, kind: DataPacketKind) -> bool {
        self.low_flag(kind).load(Ordering::Acquire)
    }

    fn publisher_channel(&self, kind: DataPacketKind) -> Option<Arc<RTCDataChannel>> {
        match kind {
            DataPacketKind::Lossy => self.lossy.lock().clone(),
            DataPacketKind::Reliable => self.reliable.lock().clone(),
        }
    }

    /// Send bytes on the publisher channel of the given kind, then
    /// re-evaluate the backpressure signal
    pub(crate) async fn send(&self, kind: DataPacketKind, data: &[u8]) -> Result<()> {
        let channel = self
            .publisher_channel(kind)
            .ok_or_else(|| Error::DataChannel(format!("{} channel not created", kind.label())))?;

        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(Error::DataChannel(format!(
                "{} channel is not open (state: {:?})",
                kind.label(),
                channel.ready_state()
            )));
        }

        channel
            .send(&Bytes::copy_from_slice(data))
            .await
            .map_err(|e| Error::DataChannel(format!("failed to send: {e}")))?;

        let buffered = channel.buffered_amount().await;
        let low = buffered <= BUFFERED_AMOUNT_LOW_THRESHOLD;
        let flag = self.low_flag(kind);
        if flag.swap(low, Ordering::AcqRel) != low {
            let _ = self
                .emitter
                .send(EngineEvent::DataChannelBufferStatus { kind, low });
        }

        Ok(())
    }

    /// Adopt a channel the subscriber transport received from the server.
    ///
    /// Inbound messages are decoded and surfaced in arrival order; the
    /// shared order lock keeps that guarantee even though decoding is
    /// asynchronous and two channels deliver concurrently.
    pub(crate) fn register_subscriber_channel(
        &self,
        channel: Arc<RTCDataChannel>,
        order_lock: Arc<AsyncMutex<()>>,
    ) {
        let kind = match channel.label() {
            LOSSY_LABEL => DataPacketKind::Lossy,
            RELIABLE_LABEL => DataPacketKind::Reliable,
            other => {
                warn!(label = other, "ignoring unknown data channel");
                return;
            }
        };

        let emitter = self.emitter.clone();
        channel.on_message(Box::new(move |message| {
            let emitter = emitter.clone();
            let order_lock = Arc::clone(&order_lock);
            Box::pin(async move {
                let _ordered = order_lock.lock().await;
                match bincode::deserialize::<DataPacket>(&message.data) {
                    Ok(packet) => {
                        let _ = emitter.send(EngineEvent::DataReceived { packet, kind });
                    }
                    Err(e) => warn!("dropping undecodable data packet: {e}"),
                }
            })
        }));

        match kind {
            DataPacketKind::Lossy => *self.sub_lossy.lock() = Some(channel),
            DataPacketKind::Reliable => *self.sub_reliable.lock() = Some(channel),
        }

        debug!(label = kind.label(), "subscriber data channel adopted");
    }

    /// Identities of the open publisher channels, replayed in sync state
    pub(crate) fn channel_infos(&self) -> Vec<DataChannelInfo> {
        let mut infos = Vec::new();
        for kind in [DataPacketKind::Lossy, DataPacketKind::Reliable] {
            if let Some(dc) = self.publisher_channel(kind) {
                if dc.ready_state() == RTCDataChannelState::Open {
                    infos.push(DataChannelInfo {
                        label: dc.label().to_string(),
                        id: dc.id(),
                    });
                }
            }
        }
        infos
    }

    /// Recreate the publisher channels when the reliable channel lost its
    /// negotiated identity across a resume.
    ///
    /// Channel identity is only assigned once negotiation completes; a
    /// channel that is no longer open after a resume has lost it.
    pub(crate) async fn recreate_if_needed(&self, pc: &Arc<RTCPeerConnection>) -> Result<bool> {
        let lost = match self.reliable.lock().as_ref() {
            Some(dc) => dc.ready_state() != RTCDataChannelState::Open,
            None => true,
        };

        if !lost {
            return Ok(false);
        }

        info!("reliable channel lost its identity, recreating data channels");
        self.close_publisher_channels().await;
        self.create_publisher_channels(pc).await?;
        Ok(true)
    }

    async fn close_publisher_channels(&self) {
        let channels = [self.lossy.lock().take(), self.reliable.lock().take()];
        for channel in channels.into_iter().flatten() {
            if let Err(e) = channel.close().await {
                warn!(label = channel.label(), "error closing channel: {e}");
            }
        }
    }

    /// Drop every channel reference
    pub(crate) async fn close(&self) {
        self.close_publisher_channels().await;
        self.lossy_open.send_replace(false);
        self.reliable_open.send_replace(false);
        *self.sub_lossy.lock() = None;
        *self.sub_reliable.lock() = None;
    }
}
