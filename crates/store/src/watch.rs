//! Change fan-out shared by store backends.

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::StoreEvent;

const DEFAULT_BUS_CAP: usize = 1024;

/// Stream of store events for one prefix.
///
/// Ends when the subscriber falls too far behind (it must re-list), when the
/// store is dropped, or after `cancel`.
pub struct WatchStream {
    pub rx: mpsc::Receiver<StoreEvent>,
    cancel: CancellationToken,
}

impl WatchStream {
    pub fn new(rx: mpsc::Receiver<StoreEvent>, cancel: CancellationToken) -> Self { Self { rx, cancel } }

    pub async fn recv(&mut self) -> Option<StoreEvent> { self.rx.recv().await }

    pub fn cancel(&self) { self.cancel.cancel(); }
}

impl Drop for WatchStream {
    fn drop(&mut self) { self.cancel.cancel(); }
}

/// Broadcast bus; backends publish after a write commits.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self { Self::with_capacity(DEFAULT_BUS_CAP) }
}

impl EventBus {
    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap.max(1));
        Self { tx }
    }

    pub fn publish(&self, ev: StoreEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(ev);
    }

    pub fn publish_all(&self, evs: Vec<StoreEvent>) {
        for ev in evs {
            self.publish(ev);
        }
    }

    /// Spawn a forwarder delivering events under `prefix`. Needs a tokio runtime.
    pub fn subscribe(&self, prefix: &str) -> WatchStream {
        let mut sub = self.tx.subscribe();
        let (tx, rx) = mpsc::channel::<StoreEvent>(DEFAULT_BUS_CAP);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    ev = sub.recv() => match ev {
                        Ok(ev) => {
                            if !ev.key.starts_with(&prefix) { continue; }
                            if tx.send(ev).await.is_err() { break; }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(prefix = %prefix, missed, "watcher lagged; closing stream");
                            metrics::counter!("store_watch_lagged_total", 1u64);
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!(prefix = %prefix, "watch forwarder stopped");
        });
        WatchStream::new(rx, cancel)
    }
}
