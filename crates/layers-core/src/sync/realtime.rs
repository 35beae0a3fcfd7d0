use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::coordinator::PersistenceCoordinator;
use super::reconcile::{reconcile, Reconciled};
use crate::auth::{RequestError, SessionManager};
use crate::backend::{ChangeFeed, ChangeStream};
use crate::config::BackoffConfig;
use crate::events::CoreEvent;
use crate::models::{ChangeNotification, ItemId};
use crate::stats::SharedSyncStats;
use crate::store::{SharedItemStore, ViewFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Subscribing,
    Subscribed,
}

/// Everything a listener needs besides the views it serves
#[derive(Clone)]
pub struct ListenerContext {
    pub store: SharedItemStore,
    /// Pending local writes are laid over incoming records
    pub coordinator: PersistenceCoordinator,
    pub feed: Arc<dyn ChangeFeed>,
    pub session: Arc<SessionManager>,
    pub stats: SharedSyncStats,
    pub events: broadcast::Sender<CoreEvent>,
    pub backoff: BackoffConfig,
}

/// Filters of the open views sharing one listener, keyed by view id
#[derive(Clone, Default)]
pub struct ViewScopes {
    inner: Arc<Mutex<HashMap<u64, ViewFilter>>>,
}

impl ViewScopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(filter: ViewFilter) -> Self {
        let scopes = Self::new();
        scopes.insert(0, filter);
        scopes
    }

    pub fn insert(&self, view: u64, filter: ViewFilter) {
        self.inner.lock().insert(view, filter);
    }

    pub fn remove(&self, view: u64) {
        self.inner.lock().remove(&view);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ViewFilter> {
        self.inner.lock().values().cloned().collect()
    }
}

/// A live subscription to the user's change feed.
///
/// Each notification is merged into the shared store in delivery order. The
/// scopes only decide whether an update is reported as leaving a view;
/// every notification for the user is applied. One listener serves every
/// open view of a core. Dropping it unsubscribes.
pub struct ReconciliationListener {
    cancel_tx: watch::Sender<bool>,
    state_tx: Arc<watch::Sender<ListenerState>>,
    applied_rx: watch::Receiver<u64>,
    scopes: ViewScopes,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconciliationListener {
    pub fn subscribe(rt_handle: &Handle, ctx: ListenerContext, scopes: ViewScopes) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state_tx = Arc::new(watch::channel(ListenerState::Disconnected).0);
        let (applied_tx, applied_rx) = watch::channel(0u64);

        let task = rt_handle.spawn(run_listener(
            ctx,
            scopes.clone(),
            state_tx.clone(),
            applied_tx,
            cancel_rx,
        ));

        Self {
            cancel_tx,
            state_tx,
            applied_rx,
            scopes,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn scopes(&self) -> &ViewScopes {
        &self.scopes
    }

    pub fn state(&self) -> ListenerState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state_tx.subscribe()
    }

    /// Count of notifications merged so far
    pub fn watch_applied(&self) -> watch::Receiver<u64> {
        self.applied_rx.clone()
    }

    pub fn is_active(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Stop listening. Returns immediately; safe to call repeatedly.
    pub fn unsubscribe(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        let _ = self.cancel_tx.send(true);
        task.abort();
        self.state_tx.send_replace(ListenerState::Disconnected);
        tracing::info!("Change listener unsubscribed");
    }
}

impl Drop for ReconciliationListener {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn set_state(ctx: &ListenerContext, state_tx: &watch::Sender<ListenerState>, state: ListenerState) {
    if *state_tx.borrow() != state {
        state_tx.send_replace(state);
        let _ = ctx.events.send(CoreEvent::ListenerState(state));
    }
}

async fn run_listener(
    ctx: ListenerContext,
    scopes: ViewScopes,
    state_tx: Arc<watch::Sender<ListenerState>>,
    applied_tx: watch::Sender<u64>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let Some(user_id) = ctx.store.user_id() else {
        tracing::warn!("Store has no owner, change listener not started");
        return;
    };

    let mut attempt: u32 = 0;
    let mut connected_before = false;

    'session: loop {
        if *cancel_rx.borrow() {
            break;
        }

        set_state(&ctx, &state_tx, ListenerState::Subscribing);
        match open_stream(&ctx, &user_id).await {
            Ok(mut stream) => {
                attempt = 0;
                if connected_before {
                    ctx.stats.update(|s| s.resubscriptions += 1);
                }
                connected_before = true;
                set_state(&ctx, &state_tx, ListenerState::Subscribed);
                tracing::info!(user = %user_id, "Subscribed to item changes");

                loop {
                    tokio::select! {
                        changed = cancel_rx.changed() => {
                            if changed.is_err() || *cancel_rx.borrow() {
                                break 'session;
                            }
                        }
                        next = stream.next() => match next {
                            Some(Ok(notification)) => {
                                let kind = notification.kind();
                                ctx.stats.record(kind);
                                let outcome = apply(&ctx, &scopes, notification);
                                record_outcome(&ctx.stats, &outcome);
                                tracing::debug!(%kind, ?outcome, "Applied change notification");
                                let _ = ctx.events.send(CoreEvent::Reconciled(outcome));
                                applied_tx.send_modify(|count| *count += 1);
                            }
                            Some(Err(e)) if e.is_connection_loss() => {
                                tracing::warn!("Change stream lost: {}", e);
                                break;
                            }
                            Some(Err(e)) => {
                                ctx.stats.update(|s| s.decode_errors += 1);
                                tracing::warn!("Skipping undecodable change notification: {}", e);
                            }
                            None => {
                                tracing::info!("Change stream closed by server");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to subscribe to item changes: {}", e);
            }
        }

        set_state(&ctx, &state_tx, ListenerState::Disconnected);

        // Events missed while disconnected are not replayed.
        let delay = ctx.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!("Resubscribing in {:?}", delay);
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    set_state(&ctx, &state_tx, ListenerState::Disconnected);
    tracing::debug!("Change listener stopped");
}

fn apply(
    ctx: &ListenerContext,
    scopes: &ViewScopes,
    notification: ChangeNotification,
) -> Reconciled {
    let scopes = scopes.snapshot();
    let coordinator = &ctx.coordinator;
    let pending = |id: &ItemId| coordinator.pending_patch_exact(id);
    let outcome = ctx
        .store
        .update(|store| reconcile(store, &scopes, notification, &pending));

    // Edits made to the temp entry now belong to the confirmed id
    if let Reconciled::TempConfirmed { temp, confirmed } = &outcome {
        coordinator.rekey(temp, confirmed);
        let _ = ctx.events.send(CoreEvent::ItemConfirmed {
            temp: temp.clone(),
            confirmed: confirmed.clone(),
        });
    }
    outcome
}

async fn open_stream(ctx: &ListenerContext, user_id: &str) -> Result<ChangeStream, RequestError> {
    let feed = &ctx.feed;
    ctx.session
        .authorized(|token| async move { feed.subscribe(&token, user_id).await })
        .await
}

fn record_outcome(stats: &SharedSyncStats, outcome: &Reconciled) {
    match outcome {
        Reconciled::EchoDropped(_) => stats.update(|s| s.echoes_dropped += 1),
        Reconciled::TempConfirmed { .. } => stats.update(|s| s.temps_confirmed += 1),
        Reconciled::LeftView(_) => stats.update(|s| s.left_view += 1),
        Reconciled::Ignored(_) => stats.update(|s| s.ignored += 1),
        _ => {}
    }
}
