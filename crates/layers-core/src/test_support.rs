//! Builders and in-memory fakes shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::auth::{MemorySessionStore, Session, SessionManager};
use crate::backend::{BackendError, ChangeFeed, ChangeStream, ItemBackend, TokenRefresher};
use crate::models::{
    CaptureSource, ChangeNotification, CreateItemPayload, Item, ItemId, ItemPatch, Layer,
};

pub const USER: &str = "user-1";

/// A confirmed item owned by `USER`, with the fields its layer implies.
pub fn item(id: &str, title: &str, layer: Layer) -> Item {
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    Item {
        id: ItemId::confirmed(id),
        user_id: USER.to_string(),
        title: title.to_string(),
        notes: None,
        layer,
        destination_id: (layer != Layer::Capture).then(|| "inbox".to_string()),
        scheduled_at: (layer == Layer::Commit).then(|| at + chrono::Duration::days(1)),
        is_completed: false,
        completed_at: None,
        archived_at: None,
        created_at: at,
        updated_at: at,
        client_key: None,
        source: CaptureSource::App,
    }
}

pub fn local_item(title: &str) -> Item {
    Item::new_local(USER, title, None, CaptureSource::App)
}

pub fn valid_session(access: &str) -> Session {
    Session::expiring_in(access.to_string(), format!("refresh-{}", access), 3_600)
}

pub fn expired_session(access: &str) -> Session {
    Session::expiring_in(access.to_string(), format!("refresh-{}", access), -60)
}

/// Session manager holding a valid session and a refresher that works
pub fn signed_in() -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        Arc::new(FakeRefresher::succeeding()),
        Arc::new(MemorySessionStore::new(Some(valid_session("a1")))),
    ))
}

/// Poll `check` until it holds. Under a paused clock every sleep
/// auto-advances, so this also lets timers and backoff run.
pub async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..2_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[derive(Default)]
pub struct FakeBackend {
    items: Mutex<HashMap<ItemId, Item>>,
    updates: Mutex<Vec<(ItemId, ItemPatch)>>,
    creates: Mutex<Vec<CreateItemPayload>>,
    deletes: Mutex<Vec<ItemId>>,
    update_failure: Mutex<Option<BackendError>>,
    create_failure: Mutex<Option<BackendError>>,
    rejected_titles: Mutex<HashSet<String>>,
    unauthorized: AtomicUsize,
    delay_ms: AtomicU64,
    next_id: AtomicU64,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<Item>) -> Self {
        let backend = Self::new();
        for item in items {
            backend.seed(item);
        }
        backend
    }

    pub fn seed(&self, item: Item) {
        self.items.lock().insert(item.id.clone(), item);
    }

    /// Every update attempt, failed ones included
    pub fn updates(&self) -> Vec<(ItemId, ItemPatch)> {
        self.updates.lock().clone()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().len()
    }

    /// Every create attempt, failed ones included
    pub fn creates(&self) -> Vec<CreateItemPayload> {
        self.creates.lock().clone()
    }

    pub fn deletes(&self) -> Vec<ItemId> {
        self.deletes.lock().clone()
    }

    pub fn fail_updates_with(&self, error: Option<BackendError>) {
        *self.update_failure.lock() = error;
    }

    pub fn fail_creates_with(&self, error: Option<BackendError>) {
        *self.create_failure.lock() = error;
    }

    pub fn reject_creates_titled(&self, title: &str) {
        self.rejected_titles.lock().insert(title.to_string());
    }

    /// Answer the next `n` requests of any kind with 401
    pub fn unauthorized_next(&self, n: usize) {
        self.unauthorized.store(n, Ordering::SeqCst);
    }

    pub fn set_delay_ms(&self, ms: u64) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    async fn respond(&self) -> Result<(), BackendError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let take_401 = self
            .unauthorized
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if take_401 {
            return Err(BackendError::Unauthorized);
        }
        Ok(())
    }
}

#[async_trait]
impl ItemBackend for FakeBackend {
    async fn update_item(
        &self,
        _token: &str,
        id: &ItemId,
        patch: &ItemPatch,
    ) -> Result<Item, BackendError> {
        self.updates.lock().push((id.clone(), patch.clone()));
        self.respond().await?;
        if let Some(e) = self.update_failure.lock().clone() {
            return Err(e);
        }
        let mut items = self.items.lock();
        let item = items
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        item.apply_patch(patch);
        Ok(item.clone())
    }

    async fn create_item(
        &self,
        _token: &str,
        payload: &CreateItemPayload,
    ) -> Result<Item, BackendError> {
        self.creates.lock().push(payload.clone());
        self.respond().await?;
        if let Some(e) = self.create_failure.lock().clone() {
            return Err(e);
        }
        if self.rejected_titles.lock().contains(&payload.title) {
            return Err(BackendError::Rejected {
                status: 422,
                message: "rejected".to_string(),
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let created = Item {
            id: ItemId::confirmed(format!("srv-{}", n)),
            user_id: USER.to_string(),
            title: payload.title.clone(),
            notes: payload.notes.clone(),
            layer: Layer::Capture,
            destination_id: None,
            scheduled_at: None,
            is_completed: false,
            completed_at: None,
            archived_at: None,
            created_at: now,
            updated_at: now,
            client_key: payload.client_key.clone(),
            source: payload.source,
        };
        self.seed(created.clone());
        Ok(created)
    }

    async fn delete_item(&self, _token: &str, id: &ItemId) -> Result<(), BackendError> {
        self.deletes.lock().push(id.clone());
        self.respond().await?;
        self.items.lock().remove(id);
        Ok(())
    }
}

type FeedItem = Result<ChangeNotification, BackendError>;

/// Change feed driven by the test. Each subscription gets its own channel;
/// pushes go to the newest one.
#[derive(Default)]
pub struct FakeFeed {
    current: Mutex<Option<mpsc::UnboundedSender<FeedItem>>>,
    subscriptions: AtomicUsize,
    failures_left: AtomicUsize,
}

impl FakeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notification: ChangeNotification) {
        self.send(Ok(notification));
    }

    pub fn push_error(&self, error: BackendError) {
        self.send(Err(error));
    }

    fn send(&self, item: FeedItem) {
        if let Some(tx) = self.current.lock().as_ref() {
            let _ = tx.unbounded_send(item);
        }
    }

    /// End the current stream, as a dropped connection would
    pub fn drop_connection(&self) {
        self.current.lock().take();
    }

    /// Subscribe attempts so far, failed ones included
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn subscribe(&self, _token: &str, _user_id: &str) -> Result<ChangeStream, BackendError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(BackendError::Network("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded();
        *self.current.lock() = Some(tx);
        Ok(rx.boxed())
    }
}

pub struct FakeRefresher {
    succeed: bool,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeRefresher {
    pub fn succeeding() -> Self {
        Self {
            succeed: true,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            succeed: false,
            ..Self::succeeding()
        }
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<Session, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.succeed {
            Ok(valid_session(&format!("fresh-{}", n)))
        } else {
            Err(BackendError::Unauthorized)
        }
    }
}
