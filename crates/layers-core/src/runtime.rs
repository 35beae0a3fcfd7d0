use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};

use crate::auth::{SessionManager, SessionStore};
use crate::backend::{ChangeFeed, HttpBackend, ItemBackend};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::events::{CoreEvent, SaveStatus};
use crate::models::{transition, CaptureSource, CreateItemPayload, Item, ItemId, ItemPatch};
use crate::stats::{SharedSyncStats, SyncStats};
use crate::store::{SharedItemStore, StoreChange, ViewFilter};
use crate::sync::{
    EditSource, FlushOutcome, ListenerContext, ListenerState, PersistenceCoordinator,
    ReconciliationListener, ViewScopes,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// External collaborators of the core
#[derive(Clone)]
pub struct CoreServices {
    pub backend: Arc<dyn ItemBackend>,
    pub feed: Arc<dyn ChangeFeed>,
    pub session: Arc<SessionManager>,
}

impl CoreServices {
    /// HTTP implementations of every collaborator, against one base URL
    pub fn http(config: &CoreConfig, sessions: Arc<dyn SessionStore>) -> Result<Self, CoreError> {
        let http = Arc::new(HttpBackend::new(
            &config.api_base_url,
            config.request_timeout(),
        )?);
        Ok(Self {
            backend: http.clone(),
            feed: http.clone(),
            session: Arc::new(SessionManager::new(http, sessions)),
        })
    }
}

/// One signed-in user's item engine: store, write coordinator, listeners.
pub struct LayersCore {
    config: CoreConfig,
    rt_handle: Handle,
    services: CoreServices,
    store: SharedItemStore,
    coordinator: PersistenceCoordinator,
    events: broadcast::Sender<CoreEvent>,
    stats: SharedSyncStats,
    /// Creates the backend has not accepted yet, for `retry_create`
    failed_creates: Mutex<HashMap<ItemId, CreateItemPayload>>,
    /// Temp items deleted before their create was confirmed
    abandoned: Mutex<HashSet<ItemId>>,
    /// Change listener shared by the open views; gone once the last closes
    listener: Mutex<Weak<ReconciliationListener>>,
    next_view: AtomicU64,
}

impl LayersCore {
    pub fn new(config: CoreConfig, rt_handle: Handle, services: CoreServices) -> Self {
        let store = SharedItemStore::new(config.user_id.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let coordinator = PersistenceCoordinator::new(
            rt_handle.clone(),
            services.backend.clone(),
            store.clone(),
            services.session.clone(),
            config.debounce(),
            events.clone(),
        );
        if config.user_id.is_none() {
            tracing::warn!("No user id configured, item store disabled");
        }
        Self {
            config,
            rt_handle,
            services,
            store,
            coordinator,
            events,
            stats: SharedSyncStats::new(),
            failed_creates: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(HashSet::new()),
            listener: Mutex::new(Weak::new()),
            next_view: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> SharedItemStore {
        self.store.clone()
    }

    pub fn session(&self) -> Arc<SessionManager> {
        self.services.session.clone()
    }

    pub fn coordinator(&self) -> &PersistenceCoordinator {
        &self.coordinator
    }

    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn save_status(&self) -> watch::Receiver<SaveStatus> {
        self.coordinator.status()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }

    pub fn items(&self, filter: &ViewFilter) -> Vec<Item> {
        self.store.subset(filter)
    }

    /// Insert optimistically under a temp id, then confirm with the
    /// backend. On failure the local item stays and `retry_create` can
    /// send it again.
    pub async fn create_item(
        &self,
        title: impl Into<String>,
        notes: Option<String>,
    ) -> Result<Item, CoreError> {
        let user_id = self.store.user_id().ok_or(CoreError::NoOwner)?;
        let local = Item::new_local(user_id, title, notes, CaptureSource::App);
        let payload = CreateItemPayload {
            title: local.title.clone(),
            notes: local.notes.clone(),
            source: local.source,
            client_key: local.client_key.clone(),
        };
        let temp = local.id.clone();
        self.store.upsert(local);
        self.confirm_create(temp, payload).await
    }

    /// Send a create that failed earlier again. When the change listener
    /// has seen the create land after all, the confirmed item is returned
    /// and nothing is sent.
    pub async fn retry_create(&self, temp: &ItemId) -> Result<Item, CoreError> {
        let payload = self
            .failed_creates
            .lock()
            .remove(temp)
            .ok_or_else(|| CoreError::ItemNotFound(temp.clone()))?;

        let resolved = self.store.resolve(temp);
        if resolved != *temp {
            tracing::debug!(%temp, %resolved, "Create already confirmed, not resending");
            return self
                .store
                .get(&resolved)
                .ok_or(CoreError::ItemNotFound(resolved));
        }
        self.confirm_create(temp.clone(), payload).await
    }

    async fn confirm_create(
        &self,
        temp: ItemId,
        payload: CreateItemPayload,
    ) -> Result<Item, CoreError> {
        let backend = &self.services.backend;
        let payload_ref = &payload;
        let result = self
            .services
            .session
            .authorized(|token| async move { backend.create_item(&token, payload_ref).await })
            .await;

        let confirmed = match result {
            Ok(confirmed) => confirmed,
            Err(e) => {
                tracing::warn!(%temp, "Create failed: {}", e);
                let _ = self.events.send(CoreEvent::SaveFailed {
                    id: temp.clone(),
                    message: e.to_string(),
                });
                self.failed_creates.lock().insert(temp, payload);
                return Err(e.into());
            }
        };
        let confirmed_id = confirmed.id.clone();

        if self.abandoned.lock().remove(&temp) {
            tracing::debug!(%temp, %confirmed_id, "Item deleted before its create landed");
            self.store.remove(&confirmed_id);
            self.coordinator.delete_now(&confirmed_id).await?;
            return Ok(confirmed);
        }

        let already = self.store.resolve(&temp);
        if already != temp && already != confirmed_id {
            tracing::warn!(
                %temp,
                %already,
                duplicate = %confirmed_id,
                "Create landed twice, deleting the copy"
            );
            self.coordinator.delete_now(&confirmed_id).await?;
            return self
                .store
                .get(&already)
                .ok_or(CoreError::ItemNotFound(already));
        }

        // Edits made while the create was in flight stay on top. The
        // listener may have confirmed it already; replace_temp copes.
        let confirmed = self.coordinator.overlay_pending(&temp, confirmed);
        self.store.replace_temp(&temp, confirmed.clone());
        self.coordinator.rekey(&temp, &confirmed_id);
        let _ = self.events.send(CoreEvent::ItemConfirmed {
            temp,
            confirmed: confirmed_id.clone(),
        });
        Ok(self.store.get(&confirmed_id).unwrap_or(confirmed))
    }

    /// Optimistic edit, persisted after the quiet period
    pub fn edit(&self, id: &ItemId, patch: ItemPatch) -> Result<Item, CoreError> {
        self.coordinator
            .edit(id, patch)
            .ok_or_else(|| CoreError::ItemNotFound(id.clone()))
    }

    pub fn rename(&self, id: &ItemId, title: impl Into<String>) -> Result<Item, CoreError> {
        self.edit(id, ItemPatch::new().with_title(title))
    }

    pub fn set_notes(&self, id: &ItemId, notes: Option<String>) -> Result<Item, CoreError> {
        self.edit(id, ItemPatch::new().with_notes(notes))
    }

    pub fn assign_destination(
        &self,
        id: &ItemId,
        destination_id: impl Into<String>,
    ) -> Result<Item, CoreError> {
        self.edit(id, transition::assign_destination(destination_id))
    }

    pub fn schedule(&self, id: &ItemId, at: DateTime<Utc>) -> Result<Item, CoreError> {
        self.edit(id, transition::schedule_for(at))
    }

    pub fn unschedule(&self, id: &ItemId) -> Result<Item, CoreError> {
        self.edit(id, transition::unschedule())
    }

    /// Completion is saved right away rather than after the quiet period.
    pub async fn complete(&self, id: &ItemId) -> Result<FlushOutcome, CoreError> {
        self.edit(id, transition::complete())?;
        Ok(self.coordinator.flush(id).await)
    }

    pub async fn reopen(&self, id: &ItemId) -> Result<FlushOutcome, CoreError> {
        self.edit(id, transition::reopen())?;
        Ok(self.coordinator.flush(id).await)
    }

    pub async fn archive(&self, id: &ItemId) -> Result<FlushOutcome, CoreError> {
        self.edit(id, transition::archive())?;
        Ok(self.coordinator.flush(id).await)
    }

    pub async fn delete(&self, id: &ItemId) -> Result<(), CoreError> {
        let resolved = self.store.resolve(id);
        if resolved.is_temp() {
            self.abandoned.lock().insert(resolved.clone());
            self.failed_creates.lock().remove(&resolved);
        }
        self.coordinator.delete_now(&resolved).await?;
        Ok(())
    }

    pub async fn flush_all(&self) -> Vec<(ItemId, FlushOutcome)> {
        self.coordinator.flush_all().await
    }

    /// Open a view over `filter`. Views share one change listener, which
    /// subscribes with the first view and unsubscribes with the last.
    pub fn open_view(&self, filter: ViewFilter) -> ViewHandle {
        let id = self.next_view.fetch_add(1, Ordering::Relaxed);
        let listener = self.store.user_id().map(|_| {
            let listener = self.shared_listener();
            listener.scopes().insert(id, filter.clone());
            listener
        });
        ViewHandle {
            id,
            filter,
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            listener: Mutex::new(listener),
            touched: Mutex::new(HashSet::new()),
        }
    }

    /// State of the shared change listener, if any view has it open
    pub fn listener_state(&self) -> ListenerState {
        self.listener
            .lock()
            .upgrade()
            .map_or(ListenerState::Disconnected, |listener| listener.state())
    }

    fn shared_listener(&self) -> Arc<ReconciliationListener> {
        let mut slot = self.listener.lock();
        if let Some(listener) = slot.upgrade() {
            return listener;
        }
        let ctx = ListenerContext {
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            feed: self.services.feed.clone(),
            session: self.services.session.clone(),
            stats: self.stats.clone(),
            events: self.events.clone(),
            backoff: self.config.resubscribe,
        };
        let listener = Arc::new(ReconciliationListener::subscribe(
            &self.rt_handle,
            ctx,
            ViewScopes::new(),
        ));
        *slot = Arc::downgrade(&listener);
        listener
    }

    /// Resume writes after the user signed in again.
    pub fn resume_writes(&self) {
        self.coordinator.resume();
    }

    /// Send everything still pending. Views should be closed first.
    pub async fn shutdown(&self) {
        let outcomes = self.flush_all().await;
        let failed = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, FlushOutcome::Failed(_)))
            .count();
        tracing::info!(
            flushed = outcomes.len(),
            failed,
            "Core shut down"
        );
    }
}

/// A mounted view: a live subset of the store plus a share of the listener
/// keeping it fresh. Closing (or dropping) it releases the listener and
/// cancels, without sending, the waiting edits only this view made. Edits
/// to the same items from elsewhere still go out.
pub struct ViewHandle {
    id: u64,
    filter: ViewFilter,
    store: SharedItemStore,
    coordinator: PersistenceCoordinator,
    listener: Mutex<Option<Arc<ReconciliationListener>>>,
    touched: Mutex<HashSet<ItemId>>,
}

impl ViewHandle {
    pub fn filter(&self) -> &ViewFilter {
        &self.filter
    }

    pub fn items(&self) -> Vec<Item> {
        self.store.subset(&self.filter)
    }

    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }

    pub fn listener_state(&self) -> ListenerState {
        self.listener
            .lock()
            .as_ref()
            .map_or(ListenerState::Disconnected, |listener| listener.state())
    }

    pub fn watch_listener(&self) -> Option<watch::Receiver<ListenerState>> {
        self.listener
            .lock()
            .as_ref()
            .map(|listener| listener.watch_state())
    }

    pub fn edit(&self, id: &ItemId, patch: ItemPatch) -> Option<Item> {
        let updated = self
            .coordinator
            .edit_from(id, patch, EditSource::View(self.id))?;
        self.touched.lock().insert(updated.id.clone());
        Some(updated)
    }

    pub async fn flush(&self, id: &ItemId) -> FlushOutcome {
        self.coordinator.flush(id).await
    }

    pub fn close(&self) {
        // Dropping the last share unsubscribes
        if let Some(listener) = self.listener.lock().take() {
            listener.scopes().remove(self.id);
        }
        for id in self.touched.lock().drain() {
            self.coordinator
                .cancel_edits_from(&id, EditSource::View(self.id));
        }
    }
}

impl Drop for ViewHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::constants::DEFAULT_DEBOUNCE_MS;
    use crate::models::{ChangeNotification, Layer};
    use crate::test_support::{eventually, item, signed_in, FakeBackend, FakeFeed, USER};
    use std::time::Duration;

    struct Fixture {
        core: LayersCore,
        backend: Arc<FakeBackend>,
        feed: Arc<FakeFeed>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(FakeBackend::new());
        let feed = Arc::new(FakeFeed::new());
        let config = CoreConfig::new("/tmp/layers-test").with_user(USER);
        let core = LayersCore::new(
            config,
            Handle::current(),
            CoreServices {
                backend: backend.clone(),
                feed: feed.clone(),
                session: signed_in(),
            },
        );
        Fixture {
            core,
            backend,
            feed,
        }
    }

    async fn wait(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_create_replaces_temp_with_confirmed_item() {
        let f = fixture();
        let mut events = f.core.events();

        let created = f.core.create_item("Call Bob", None).await.unwrap();
        assert_eq!(created.id, ItemId::confirmed("srv-1"));

        let all = f.core.items(&ViewFilter::All);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, created.id);
        assert!(matches!(
            events.try_recv().unwrap(),
            CoreEvent::ItemConfirmed { .. }
        ));
        assert_eq!(f.backend.creates()[0].source, CaptureSource::App);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_edit_before_confirmation_goes_to_confirmed_id() {
        let f = fixture();
        f.backend.set_delay_ms(200);

        let editing = async {
            wait(50).await;
            let temp = f.core.items(&ViewFilter::All)[0].id.clone();
            assert!(temp.is_temp());
            f.core.rename(&temp, "Call Bob today").unwrap();
        };
        let (created, ()) = tokio::join!(f.core.create_item("Call Bob", None), editing);
        let created = created.unwrap();

        wait(DEFAULT_DEBOUNCE_MS + 100).await;
        let updates = f.backend.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, created.id);
        assert_eq!(updates[0].1.title.as_deref(), Some("Call Bob today"));
        assert_eq!(
            f.core.store().get(&created.id).unwrap().title,
            "Call Bob today"
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_own_echo_does_not_duplicate() {
        let f = fixture();
        let view = f.core.open_view(ViewFilter::Layer(Layer::Capture));
        eventually(|| view.listener_state() == ListenerState::Subscribed).await;

        let created = f.core.create_item("Buy milk", None).await.unwrap();
        f.feed.push(ChangeNotification::Insert { record: created });
        eventually(|| f.core.stats().total == 1).await;

        assert_eq!(view.items().len(), 1);
        assert_eq!(f.core.stats().echoes_dropped, 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_closing_view_cancels_its_pending_edits() {
        let f = fixture();
        f.core.store().upsert(item("a", "x", Layer::Capture));
        f.backend.seed(item("a", "x", Layer::Capture));

        let view = f.core.open_view(ViewFilter::Layer(Layer::Capture));
        eventually(|| view.listener_state() == ListenerState::Subscribed).await;
        view.edit(&ItemId::confirmed("a"), ItemPatch::new().with_title("y"));
        drop(view);

        wait(1_000).await;
        assert_eq!(f.backend.update_count(), 0);
        assert_eq!(f.feed.subscriptions(), 1);
        assert_eq!(f.core.store().get(&ItemId::confirmed("a")).unwrap().title, "y");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_closing_view_keeps_edits_made_elsewhere() {
        let f = fixture();
        let id = ItemId::confirmed("a");
        f.core.store().upsert(item("a", "x", Layer::Capture));
        f.backend.seed(item("a", "x", Layer::Capture));

        let view = f.core.open_view(ViewFilter::Layer(Layer::Capture));
        view.edit(&id, ItemPatch::new().with_title("y"));
        f.core.set_notes(&id, Some("call first".to_string())).unwrap();
        drop(view);

        wait(1_000).await;
        let updates = f.backend.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.title, None);
        assert_eq!(updates[0].1.notes, Some(Some("call first".to_string())));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_views_share_one_subscription() {
        let f = fixture();
        let inbox = f.core.open_view(ViewFilter::Layer(Layer::Capture));
        let process = f.core.open_view(ViewFilter::Layer(Layer::Process));
        eventually(|| f.core.listener_state() == ListenerState::Subscribed).await;
        assert_eq!(f.feed.subscriptions(), 1);
        assert_eq!(process.listener_state(), ListenerState::Subscribed);

        f.feed.push(ChangeNotification::Insert {
            record: item("a", "Sort me", Layer::Capture),
        });
        eventually(|| f.core.stats().total == 1).await;
        let mut filed = item("a", "Sort me", Layer::Process);
        filed.destination_id = Some("home".to_string());
        f.feed.push(ChangeNotification::Update { record: filed });
        eventually(|| f.core.stats().total == 2).await;
        assert_eq!(f.core.stats().left_view, 1);
        assert!(inbox.items().is_empty());
        assert_eq!(process.items().len(), 1);

        // Still listening for the view left open
        drop(inbox);
        wait(100).await;
        assert_eq!(process.listener_state(), ListenerState::Subscribed);

        drop(process);
        assert_eq!(f.core.listener_state(), ListenerState::Disconnected);
        let reopened = f.core.open_view(ViewFilter::All);
        eventually(|| reopened.listener_state() == ListenerState::Subscribed).await;
        assert_eq!(f.feed.subscriptions(), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_own_echo_keeps_a_newer_pending_edit() {
        let f = fixture();
        let id = ItemId::confirmed("a");
        f.core.store().upsert(item("a", "x", Layer::Capture));
        f.backend.seed(item("a", "x", Layer::Capture));
        let view = f.core.open_view(ViewFilter::All);
        eventually(|| view.listener_state() == ListenerState::Subscribed).await;

        f.core.rename(&id, "first").unwrap();
        f.core.coordinator().flush(&id).await;
        f.core.rename(&id, "second").unwrap();
        f.feed.push(ChangeNotification::Update {
            record: item("a", "first", Layer::Capture),
        });
        eventually(|| f.core.stats().total == 1).await;

        assert_eq!(f.core.store().get(&id).unwrap().title, "second");
        assert!(f.core.coordinator().has_pending(&id));
        wait(DEFAULT_DEBOUNCE_MS + 100).await;
        assert_eq!(f.backend.updates()[1].1.title.as_deref(), Some("second"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_retry_after_listener_confirmed_does_not_create_twice() {
        let f = fixture();
        let view = f.core.open_view(ViewFilter::All);
        eventually(|| view.listener_state() == ListenerState::Subscribed).await;
        f.backend
            .fail_creates_with(Some(BackendError::Network("timed out".to_string())));

        assert!(f.core.create_item("Plan trip", None).await.is_err());
        let local = f.core.items(&ViewFilter::All)[0].clone();

        // The request timed out, but the backend stored it
        let mut landed = local.clone();
        landed.id = ItemId::confirmed("srv-remote");
        f.feed.push(ChangeNotification::Insert { record: landed });
        eventually(|| f.core.stats().temps_confirmed == 1).await;

        f.backend.fail_creates_with(None);
        let confirmed = f.core.retry_create(&local.id).await.unwrap();
        assert_eq!(confirmed.id, ItemId::confirmed("srv-remote"));
        assert_eq!(f.backend.creates().len(), 1);
        assert_eq!(f.core.items(&ViewFilter::All).len(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failed_create_keeps_local_item_and_can_be_retried() {
        let f = fixture();
        f.backend
            .fail_creates_with(Some(BackendError::Network("offline".to_string())));

        assert!(f.core.create_item("Plan trip", None).await.is_err());
        let local = f.core.items(&ViewFilter::All);
        assert_eq!(local.len(), 1);
        let temp = local[0].id.clone();
        assert!(temp.is_temp());

        f.backend.fail_creates_with(None);
        let confirmed = f.core.retry_create(&temp).await.unwrap();
        assert!(!confirmed.id.is_temp());
        assert_eq!(f.core.items(&ViewFilter::All).len(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_delete_before_confirmation_deletes_on_backend() {
        let f = fixture();
        f.backend.set_delay_ms(200);

        let deleting = async {
            wait(50).await;
            let temp = f.core.items(&ViewFilter::All)[0].id.clone();
            f.core.delete(&temp).await.unwrap();
        };
        let (created, ()) = tokio::join!(f.core.create_item("Oops", None), deleting);
        let created = created.unwrap();

        assert!(f.core.store().is_empty());
        assert_eq!(f.backend.deletes(), vec![created.id]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_complete_saves_immediately() {
        let f = fixture();
        f.core.store().upsert(item("a", "x", Layer::Process));
        f.backend.seed(item("a", "x", Layer::Process));

        let outcome = f.core.complete(&ItemId::confirmed("a")).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Saved(ref saved) if saved.is_completed));
        assert_eq!(f.core.items(&ViewFilter::Completed).len(), 1);
        assert!(f.core.items(&ViewFilter::Layer(Layer::Process)).is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_store_without_owner_rejects_creates() {
        let core = LayersCore::new(
            CoreConfig::new("/tmp/layers-test"),
            Handle::current(),
            CoreServices {
                backend: Arc::new(FakeBackend::new()),
                feed: Arc::new(FakeFeed::new()),
                session: signed_in(),
            },
        );
        assert_eq!(
            core.create_item("x", None).await.unwrap_err(),
            CoreError::NoOwner
        );
        let view = core.open_view(ViewFilter::All);
        assert_eq!(view.listener_state(), ListenerState::Disconnected);
    }
}
