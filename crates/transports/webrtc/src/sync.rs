//! Cancellation primitive shared by every bounded wait

use std::sync::Arc;

use tokio::sync::watch;

/// Clonable cancellation token.
///
/// Every bounded wait in this crate (join handshake, transport connection,
/// negotiation round trip) accepts one of these; cancelling rejects the
/// pending operation with [`crate::Error::Cancelled`] and triggers cleanup
/// rather than leaving the wait orphaned.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl CancelToken {
    /// Create a fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every clone of this token
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancellation is signalled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for cannot fail here, the sender is held by self
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
