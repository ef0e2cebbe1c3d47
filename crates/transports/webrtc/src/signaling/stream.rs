//! Low-level websocket stream for the signaling channel
//!
//! Owns the split sink/stream halves of one websocket connection. Outgoing
//! frames are funneled through an unbounded channel into a writer task;
//! inbound frames are decoded in a reader task and surfaced as
//! [`StreamEvent`]s. Dropping the stream aborts both tasks, which is what
//! guarantees a timed-out connection attempt leaves nothing running.

use futures_util::{SinkExt, StreamExt};
use roomlink_core::protocol::codec;
use roomlink_core::{SignalResponse, WireFrame};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Grace period for the socket to finish its own close handshake
const CLOSE_GRACE: std::time::Duration = std::time::Duration::from_millis(250);

/// Events surfaced by the reader task
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// A decoded inbound message
    Message(Box<SignalResponse>),
    /// The connection ended, with a best-effort reason
    Closed(String),
}

/// One live websocket connection to the signal endpoint
pub(crate) struct SignalStream {
    write_tx: mpsc::UnboundedSender<Message>,
    write_task: JoinHandle<()>,
    read_task: JoinHandle<()>,
}

impl SignalStream {
    /// Open the websocket and start the reader/writer tasks
    pub(crate) async fn connect(
        url: Url,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StreamEvent>)> {
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(format!("failed to connect: {e}")))?;

        let (ws_tx, ws_rx) = ws.split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let write_task = tokio::spawn(Self::write_loop(ws_tx, write_rx));
        let read_task = tokio::spawn(Self::read_loop(ws_rx, event_tx));

        Ok((
            Self {
                write_tx,
                write_task,
                read_task,
            },
            event_rx,
        ))
    }

    /// Queue a frame for transmission
    pub(crate) fn send(&self, frame: WireFrame) -> Result<()> {
        let message = match frame {
            WireFrame::Binary(bytes) => Message::Binary(bytes),
            WireFrame::Text(text) => Message::Text(text),
        };

        self.write_tx
            .send(message)
            .map_err(|_| Error::WebSocket("stream writer is gone".to_string()))
    }

    /// Close the connection.
    ///
    /// The reader is detached first so no stale events fire during
    /// teardown, then the socket's own close handshake is raced against a
    /// fixed grace period.
    pub(crate) async fn close(mut self) {
        self.read_task.abort();
        let _ = self.write_tx.send(Message::Close(None));

        if tokio::time::timeout(CLOSE_GRACE, &mut self.write_task)
            .await
            .is_err()
        {
            self.write_task.abort();
        }

        debug!("signal stream closed");
    }

    async fn write_loop(
        mut ws_tx: futures_util::stream::SplitSink<WsStream, Message>,
        mut write_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(message) = write_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = ws_tx.send(message).await {
                warn!("failed to write signal frame: {e}");
                break;
            }
            if closing {
                break;
            }
        }

        debug!("signal writer terminated");
    }

    async fn read_loop(
        mut ws_rx: futures_util::stream::SplitStream<WsStream>,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
    ) {
        while let Some(message) = ws_rx.next().await {
            let frame = match message {
                Ok(Message::Binary(bytes)) => WireFrame::Binary(bytes),
                Ok(Message::Text(text)) => WireFrame::Text(text),
                Ok(Message::Close(_)) => {
                    let _ = event_tx.send(StreamEvent::Closed(
                        "connection closed by server".to_string(),
                    ));
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    let _ = event_tx.send(StreamEvent::Closed(e.to_string()));
                    return;
                }
            };

            match codec::decode_response(&frame) {
                Ok(response) => {
                    if event_tx
                        .send(StreamEvent::Message(Box::new(response)))
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => warn!("dropping undecodable signal frame: {e}"),
            }
        }

        let _ = event_tx.send(StreamEvent::Closed("connection closed".to_string()));
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}
