use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::storage::{QueueStorage, QueueStorageError};
use crate::auth::{RequestError, SessionManager};
use crate::backend::ItemBackend;
use crate::models::{Item, QueuedCapture};

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    /// The capture is waiting in the queue instead of being saved
    pub queued: bool,
    /// The created item when the capture went straight through
    pub item: Option<Item>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub remaining: usize,
    /// Why the drain stopped early, if it did
    pub stopped: Option<String>,
}

/// Capture path for clients that may be offline or signed out.
///
/// Submissions are tried immediately; anything that fails is appended to a
/// durable queue and delivered later in submission order. Entries leave the
/// queue only after the backend accepted them.
pub struct OfflineCaptureQueue {
    storage: Mutex<QueueStorage>,
    backend: Arc<dyn ItemBackend>,
    session: Arc<SessionManager>,
    drain_lock: tokio::sync::Mutex<()>,
    len_tx: watch::Sender<usize>,
}

impl OfflineCaptureQueue {
    pub fn open(path: PathBuf, backend: Arc<dyn ItemBackend>, session: Arc<SessionManager>) -> Self {
        let storage = QueueStorage::open(path);
        let (len_tx, _) = watch::channel(storage.len());
        Self {
            storage: Mutex::new(storage),
            backend,
            session,
            drain_lock: tokio::sync::Mutex::new(()),
            len_tx,
        }
    }

    pub fn len(&self) -> usize {
        self.storage.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.lock().is_empty()
    }

    /// Queue length for badges
    pub fn watch_len(&self) -> watch::Receiver<usize> {
        self.len_tx.subscribe()
    }

    pub fn entries(&self) -> Vec<QueuedCapture> {
        self.storage.lock().entries().to_vec()
    }

    /// Load or save problem from the last storage operation
    pub fn last_error(&self) -> Option<QueueStorageError> {
        self.storage.lock().last_error().cloned()
    }

    fn publish_len(&self) {
        let len = self.len();
        self.len_tx.send_replace(len);
    }

    /// Capture `text`. Only a failure to write the queue file is an error;
    /// a failed delivery just queues the capture.
    pub async fn submit(&self, text: &str) -> Result<SubmitOutcome, QueueStorageError> {
        let capture = QueuedCapture::from_text(text);

        match self.deliver(&capture).await {
            Ok(item) => {
                tracing::info!(id = %item.id, "Capture saved");
                if !self.is_empty() {
                    let report = self.drain().await;
                    tracing::debug!(?report, "Drained after successful capture");
                }
                Ok(SubmitOutcome {
                    queued: false,
                    item: Some(item),
                })
            }
            Err(e) => {
                tracing::warn!("Capture not delivered, queueing: {}", e);
                self.storage.lock().push(capture)?;
                self.publish_len();
                Ok(SubmitOutcome {
                    queued: true,
                    item: None,
                })
            }
        }
    }

    /// Deliver queued captures oldest first, stopping at the first failure.
    /// Concurrent calls run one after the other.
    pub async fn drain(&self) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        loop {
            let Some(next) = self.storage.lock().front().cloned() else {
                break;
            };
            match self.deliver(&next).await {
                Ok(item) => {
                    tracing::debug!(id = %item.id, title = %next.title, "Delivered queued capture");
                    if let Err(e) = self.storage.lock().remove_front() {
                        tracing::error!("Delivered capture could not be removed: {}", e);
                        report.stopped = Some(e.to_string());
                        break;
                    }
                    report.delivered += 1;
                    self.publish_len();
                }
                Err(e) => {
                    tracing::warn!("Queue drain stopped: {}", e);
                    report.stopped = Some(e.to_string());
                    break;
                }
            }
        }

        report.remaining = self.len();
        if report.delivered > 0 {
            tracing::info!(
                delivered = report.delivered,
                remaining = report.remaining,
                "Capture queue drained"
            );
        }
        report
    }

    async fn deliver(&self, capture: &QueuedCapture) -> Result<Item, RequestError> {
        let backend = &self.backend;
        let payload = &capture.to_payload();
        self.session
            .authorized(|token| async move { backend.create_item(&token, payload).await })
            .await
    }
}
