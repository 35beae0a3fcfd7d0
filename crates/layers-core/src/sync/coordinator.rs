//! Debounced persistence of local edits.
//!
//! Edits land in the store immediately. The coordinator collects the
//! matching patches per item and sends one request once the item has been
//! quiet for the debounce period. Each item has its own timer; a new edit
//! for the item restarts it.
//!
//! Failures never reach the caller that scheduled the edit. They show up
//! in [`SaveStatus`] and as [`CoreEvent::SaveFailed`], and the optimistic
//! copy in the store is left as is. Nothing is retried automatically.
//!
//! Lock order: the store lock is always taken before the coordinator's own
//! state lock, never the other way round. The change listener reads pending
//! writes while it holds the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::auth::{AuthError, RequestError, SessionManager};
use crate::backend::{BackendError, ItemBackend};
use crate::constants::SAVED_SETTLE_MS;
use crate::events::{CoreEvent, SaveStatus};
use crate::models::{transition, Item, ItemId, ItemPatch, PatchFields};
use crate::store::SharedItemStore;

/// Result of sending (or trying to send) one item's pending patch
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing pending, or the merged patch changed nothing
    Nothing,
    /// The backend accepted the write and returned this record
    Saved(Item),
    Failed(String),
    /// The item only has a temp id so far; the write waits for `rekey`
    Deferred,
    /// Writes are paused after a failed session refresh
    Halted,
}

/// Who made an edit. Views cancel only what they edited when they close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditSource {
    Core,
    View(u64),
}

struct PendingWrite {
    patch: ItemPatch,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    /// Fields each source has set in `patch`
    sources: HashMap<EditSource, PatchFields>,
}

impl PendingWrite {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn touch(&mut self, source: EditSource, fields: PatchFields) {
        let entry = self.sources.entry(source).or_default();
        *entry = entry.union(fields);
    }

    /// Fields set by `source` and by nobody else
    fn owned_by(&self, source: EditSource) -> PatchFields {
        let Some(mine) = self.sources.get(&source) else {
            return PatchFields::empty();
        };
        let others = self
            .sources
            .iter()
            .filter(|(other, _)| **other != source)
            .fold(PatchFields::empty(), |acc, (_, fields)| acc.union(*fields));
        mine.difference(others)
    }
}

#[derive(Default)]
struct CoordinatorState {
    pending: HashMap<ItemId, PendingWrite>,
    /// Last patch that failed per item, kept for `retry`
    failed: HashMap<ItemId, (ItemPatch, String)>,
    halted: bool,
    in_flight: usize,
    next_generation: u64,
    settle: Option<JoinHandle<()>>,
}

impl CoordinatorState {
    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn pending_entry(&mut self, id: ItemId) -> &mut PendingWrite {
        let generation = self.bump_generation();
        self.pending.entry(id).or_insert_with(|| PendingWrite {
            patch: ItemPatch::new(),
            timer: None,
            generation,
            sources: HashMap::new(),
        })
    }

    /// Keep a write that cannot go out yet. Anything scheduled for the
    /// item in the meantime is newer and stays on top.
    fn park(&mut self, id: ItemId, patch: ItemPatch) {
        let entry = self.pending_entry(id);
        let newer = std::mem::replace(&mut entry.patch, patch);
        entry.patch.merge(newer);
    }
}

struct Shared {
    rt_handle: Handle,
    backend: Arc<dyn ItemBackend>,
    store: SharedItemStore,
    session: Arc<SessionManager>,
    quiet_period: Duration,
    events: broadcast::Sender<CoreEvent>,
    status_tx: watch::Sender<SaveStatus>,
    state: Mutex<CoordinatorState>,
}

/// Per-item write coalescing. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct PersistenceCoordinator {
    shared: Arc<Shared>,
}

impl PersistenceCoordinator {
    pub fn new(
        rt_handle: Handle,
        backend: Arc<dyn ItemBackend>,
        store: SharedItemStore,
        session: Arc<SessionManager>,
        quiet_period: Duration,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SaveStatus::Idle);
        Self {
            shared: Arc::new(Shared {
                rt_handle,
                backend,
                store,
                session,
                quiet_period,
                events,
                status_tx,
                state: Mutex::new(CoordinatorState::default()),
            }),
        }
    }

    pub fn status(&self) -> watch::Receiver<SaveStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn current_status(&self) -> SaveStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.shared.state.lock().halted
    }

    pub fn pending_ids(&self) -> Vec<ItemId> {
        self.shared.state.lock().pending.keys().cloned().collect()
    }

    pub fn has_pending(&self, id: &ItemId) -> bool {
        let id = self.shared.store.resolve(id);
        self.shared.state.lock().pending.contains_key(&id)
    }

    /// Copy of the write still waiting for `id`
    pub fn pending_patch(&self, id: &ItemId) -> Option<ItemPatch> {
        let id = self.shared.store.resolve(id);
        self.pending_patch_exact(&id)
    }

    /// Like `pending_patch`, without resolving the id through the store.
    /// Safe to call while holding the store lock.
    pub fn pending_patch_exact(&self, id: &ItemId) -> Option<ItemPatch> {
        self.shared
            .state
            .lock()
            .pending
            .get(id)
            .map(|write| write.patch.clone())
    }

    /// `item` as it will look once the pending write for `id` lands.
    /// Used wherever a backend copy replaces the local one.
    pub fn overlay_pending(&self, id: &ItemId, item: Item) -> Item {
        let pending = self.pending_patch(id);
        transition::overlay(item, pending.as_ref())
    }

    /// Apply `patch` to the store copy right away and schedule it for
    /// persistence. Returns the optimistic item, or `None` when the item
    /// is not in the store.
    pub fn edit(&self, id: &ItemId, patch: ItemPatch) -> Option<Item> {
        self.edit_from(id, patch, EditSource::Core)
    }

    pub fn edit_from(&self, id: &ItemId, patch: ItemPatch, source: EditSource) -> Option<Item> {
        let (updated, finalized) = self.shared.store.update(|store| {
            let mut item = store.get(id)?.clone();
            let finalized = transition::apply(&item, patch);
            item.apply_patch(&finalized);
            store.upsert(item.clone());
            Some((item, finalized))
        })?;
        self.schedule_from(&updated.id, finalized, source);
        Some(updated)
    }

    /// Merge `patch` into the item's pending write and restart its timer.
    pub fn schedule(&self, id: &ItemId, patch: ItemPatch) {
        self.schedule_from(id, patch, EditSource::Core);
    }

    fn schedule_from(&self, id: &ItemId, patch: ItemPatch, source: EditSource) {
        let id = self.shared.store.resolve(id);
        let mut state = self.shared.state.lock();
        let generation = state.bump_generation();
        let entry = state.pending_entry(id.clone());
        entry.touch(source, patch.fields());
        entry.patch.merge(patch);
        entry.generation = generation;
        entry.stop_timer();
        entry.timer = Some(self.spawn_timer(id, generation));
    }

    /// Send the item's pending write now.
    pub async fn flush(&self, id: &ItemId) -> FlushOutcome {
        let id = self.shared.store.resolve(id);
        let pending = {
            let mut state = self.shared.state.lock();
            state.pending.remove(&id).map(|mut write| {
                write.stop_timer();
                write.patch
            })
        };
        match pending {
            Some(patch) => self.dispatch(id, patch).await,
            None => FlushOutcome::Nothing,
        }
    }

    /// Drop the pending write without sending it.
    pub fn cancel(&self, id: &ItemId) {
        let id = self.shared.store.resolve(id);
        if let Some(mut write) = self.shared.state.lock().pending.remove(&id) {
            write.stop_timer();
            tracing::debug!(%id, "Cancelled pending write");
        }
    }

    /// Drop the fields only `source` has edited from the pending write. The
    /// rest stays scheduled; an emptied write is dropped with its timer.
    pub fn cancel_edits_from(&self, id: &ItemId, source: EditSource) {
        let id = self.shared.store.resolve(id);
        let mut state = self.shared.state.lock();
        let Some(write) = state.pending.get_mut(&id) else {
            return;
        };
        let dropped = write.owned_by(source);
        write.patch.clear_fields(dropped);
        write.sources.remove(&source);
        if write.patch.is_empty() {
            if let Some(mut write) = state.pending.remove(&id) {
                write.stop_timer();
            }
            tracing::debug!(%id, ?source, "Cancelled pending write");
        } else if !dropped.is_empty() {
            tracing::debug!(%id, ?source, "Cancelled part of pending write");
        }
    }

    /// Flush every pending item.
    pub async fn flush_all(&self) -> Vec<(ItemId, FlushOutcome)> {
        let ids = self.pending_ids();
        let flushes = ids.into_iter().map(|id| async move {
            let outcome = self.flush(&id).await;
            (id, outcome)
        });
        futures::future::join_all(flushes).await
    }

    /// Merge `patch` and send immediately: completion, explicit save.
    pub async fn commit_now(&self, id: &ItemId, patch: ItemPatch) -> FlushOutcome {
        let id = self.shared.store.resolve(id);
        {
            let mut state = self.shared.state.lock();
            let entry = state.pending_entry(id.clone());
            entry.stop_timer();
            entry.touch(EditSource::Core, patch.fields());
            entry.patch.merge(patch);
        }
        self.flush(&id).await
    }

    /// Delete on the backend, then from the store. Pending edits for the
    /// item are discarded first so they cannot resurrect it.
    pub async fn delete_now(&self, id: &ItemId) -> Result<(), RequestError> {
        let id = self.shared.store.resolve(id);
        self.cancel(&id);
        {
            let mut state = self.shared.state.lock();
            state.failed.remove(&id);
            if state.halted {
                return Err(halted_error());
            }
        }

        if id.is_temp() {
            // Never reached the backend; the create path deletes the
            // confirmed copy if it lands after this.
            self.shared.store.remove(&id);
            return Ok(());
        }

        self.begin_save();
        let backend = &self.shared.backend;
        let id_ref = &id;
        let result = self
            .shared
            .session
            .authorized(|token| async move { backend.delete_item(&token, id_ref).await })
            .await;

        match result {
            Ok(()) | Err(RequestError::Backend(BackendError::NotFound(_))) => {
                self.shared.store.remove(&id);
                self.finish_save(None);
                tracing::info!(%id, "Deleted item");
                Ok(())
            }
            Err(e) => {
                self.record_failure(&id, None, &e);
                Err(e)
            }
        }
    }

    /// Re-send the last failed patch for the item, merged with anything
    /// edited since.
    pub async fn retry(&self, id: &ItemId) -> FlushOutcome {
        let id = self.shared.store.resolve(id);
        let patch = {
            let mut state = self.shared.state.lock();
            let Some((mut patch, _)) = state.failed.remove(&id) else {
                return FlushOutcome::Nothing;
            };
            if let Some(mut newer) = state.pending.remove(&id) {
                newer.stop_timer();
                patch.merge(newer.patch);
            }
            patch
        };
        self.dispatch(id, patch).await
    }

    /// Move pending and failed writes from a temp id to its confirmed id
    /// and start the quiet period for them.
    pub fn rekey(&self, temp: &ItemId, confirmed: &ItemId) {
        let mut state = self.shared.state.lock();
        if let Some((patch, message)) = state.failed.remove(temp) {
            state.failed.insert(confirmed.clone(), (patch, message));
        }
        let Some(mut moved) = state.pending.remove(temp) else {
            return;
        };
        moved.stop_timer();

        let generation = state.bump_generation();
        let mut patch = moved.patch;
        let mut sources = moved.sources;
        if let Some(mut existing) = state.pending.remove(confirmed) {
            existing.stop_timer();
            patch.merge(existing.patch);
            for (source, fields) in existing.sources {
                let entry = sources.entry(source).or_default();
                *entry = entry.union(fields);
            }
        }
        tracing::debug!(%temp, %confirmed, "Moved pending write to confirmed id");
        state.pending.insert(
            confirmed.clone(),
            PendingWrite {
                patch,
                timer: Some(self.spawn_timer(confirmed.clone(), generation)),
                generation,
                sources,
            },
        );
    }

    /// Lift the halt after the user signed in again and restart timers for
    /// everything that piled up.
    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        if !state.halted {
            return;
        }
        state.halted = false;
        tracing::info!("Resuming writes");

        let ids: Vec<ItemId> = state
            .pending
            .iter()
            .filter(|(id, write)| write.timer.is_none() && !id.is_temp())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let generation = state.bump_generation();
            let timer = self.spawn_timer(id.clone(), generation);
            if let Some(write) = state.pending.get_mut(&id) {
                write.generation = generation;
                write.timer = Some(timer);
            }
        }
        drop(state);
        self.shared.status_tx.send_replace(SaveStatus::Idle);
    }

    fn spawn_timer(&self, id: ItemId, generation: u64) -> JoinHandle<()> {
        let coordinator = self.clone();
        let quiet_period = self.shared.quiet_period;
        self.shared.rt_handle.spawn(async move {
            tokio::time::sleep(quiet_period).await;
            coordinator.fire(id, generation).await;
        })
    }

    async fn fire(&self, id: ItemId, generation: u64) {
        // Take the entry before awaiting so a later edit starts a fresh
        // pending write instead of aborting this send.
        let patch = {
            let mut state = self.shared.state.lock();
            let current = state.pending.get(&id).map(|write| write.generation);
            if current == Some(generation) {
                state.pending.remove(&id).map(|write| write.patch)
            } else {
                None
            }
        };
        if let Some(patch) = patch {
            self.dispatch(id, patch).await;
        }
    }

    /// Park the write when it cannot go out yet; otherwise send it.
    async fn dispatch(&self, id: ItemId, patch: ItemPatch) -> FlushOutcome {
        // A timer armed under a temp id may fire after the listener
        // confirmed the item.
        let id = self.shared.store.resolve(&id);
        {
            let mut state = self.shared.state.lock();
            let parked = if state.halted {
                Some(FlushOutcome::Halted)
            } else if id.is_temp() {
                Some(FlushOutcome::Deferred)
            } else {
                None
            };
            if let Some(outcome) = parked {
                tracing::debug!(%id, ?outcome, "Write parked");
                state.park(id, patch);
                return outcome;
            }
        }
        self.send(id, patch).await
    }

    async fn send(&self, id: ItemId, patch: ItemPatch) -> FlushOutcome {
        let Some(current) = self.shared.store.get(&id) else {
            tracing::debug!(%id, "Item left the store, dropping its pending write");
            return FlushOutcome::Nothing;
        };
        let finalized = transition::apply(&current, patch.clone());
        if finalized.is_empty() {
            return FlushOutcome::Nothing;
        }

        self.begin_save();
        let backend = &self.shared.backend;
        let (id_ref, patch_ref) = (&id, &finalized);
        let result = self
            .shared
            .session
            .authorized(|token| async move { backend.update_item(&token, id_ref, patch_ref).await })
            .await;

        match result {
            Ok(saved) => {
                let merged = {
                    let mut state = self.shared.state.lock();
                    state.failed.remove(&id);
                    // Edits made while the request was in flight stay on top.
                    transition::overlay(
                        saved.clone(),
                        state.pending.get(&id).map(|write| &write.patch),
                    )
                };
                self.shared.store.upsert(merged);
                self.finish_save(None);
                tracing::debug!(%id, "Saved item");
                FlushOutcome::Saved(saved)
            }
            Err(e) => {
                self.record_failure(&id, Some(patch), &e);
                FlushOutcome::Failed(e.to_string())
            }
        }
    }

    fn begin_save(&self) {
        let mut state = self.shared.state.lock();
        state.in_flight += 1;
        if let Some(settle) = state.settle.take() {
            settle.abort();
        }
        self.shared.status_tx.send_replace(SaveStatus::Saving);
    }

    /// End one in-flight request. `error` is the failure message, if any.
    fn finish_save(&self, error: Option<String>) {
        let mut state = self.shared.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);

        if let Some(message) = error {
            self.shared.status_tx.send_replace(SaveStatus::Error(message));
            return;
        }
        if state.in_flight > 0 {
            return;
        }
        if let Some((_, message)) = state.failed.values().next() {
            self.shared
                .status_tx
                .send_replace(SaveStatus::Error(message.clone()));
            return;
        }

        self.shared.status_tx.send_replace(SaveStatus::Saved);
        let shared = self.shared.clone();
        state.settle = Some(self.shared.rt_handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(SAVED_SETTLE_MS)).await;
            shared.status_tx.send_if_modified(|status| {
                if *status == SaveStatus::Saved {
                    *status = SaveStatus::Idle;
                    true
                } else {
                    false
                }
            });
        }));
    }

    fn record_failure(&self, id: &ItemId, patch: Option<ItemPatch>, error: &RequestError) {
        let message = error.to_string();
        tracing::warn!(%id, "Save failed: {}", message);
        {
            let mut state = self.shared.state.lock();
            if let Some(patch) = patch {
                state.failed.insert(id.clone(), (patch, message.clone()));
            }
            if error.is_auth() && !state.halted {
                state.halted = true;
                tracing::warn!("Session refresh failed, halting writes until sign-in");
                let _ = self.shared.events.send(CoreEvent::SessionExpired);
            }
        }
        let _ = self.shared.events.send(CoreEvent::SaveFailed {
            id: id.clone(),
            message: message.clone(),
        });
        self.finish_save(Some(message));
    }
}

fn halted_error() -> RequestError {
    RequestError::Auth(AuthError::RefreshFailed(
        "writes are paused until sign-in".to_string(),
    ))
}
