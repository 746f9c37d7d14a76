//! Cooperative run control
//!
//! Pause and cancel are requested from outside the run and observed by the engine
//! between records only.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Handle shared between a running pass and whoever controls it
#[derive(Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    pause_tx: Arc<watch::Sender<bool>>,
    pause_rx: watch::Receiver<bool>,
}

impl RunControl {
    pub fn new() -> Self {
        let (pause_tx, pause_rx) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause_tx: Arc::new(pause_tx),
            pause_rx,
        }
    }

    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
    }

    /// Cancel wins over pause; a paused run wakes and stops
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_rx.borrow()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves when the run is resumed; pending forever if the sender is gone
    pub(crate) async fn resumed(&self) {
        let mut rx = self.pause_rx.clone();
        if rx.wait_for(|paused| !*paused).await.map(|_| ()).is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}
