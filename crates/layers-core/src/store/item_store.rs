use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::views::ViewFilter;
use crate::models::{Item, ItemId};

const CHANGE_CHANNEL_CAPACITY: usize = 256;
/// Confirmed temp ids remembered for late callers; oldest go first
const ALIAS_CAPACITY: usize = 1_024;

/// Notification that the store changed. Views re-derive on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Upserted(ItemId),
    Removed(ItemId),
    /// A temp entry was swapped for its backend-confirmed replacement
    Confirmed { temp: ItemId, confirmed: ItemId },
}

/// In-memory collection of the current user's items: the single source of
/// truth every view derives from.
///
/// There is exactly one entry per id. Mutations are synchronous and complete
/// before returning, so readers never see half-applied state.
pub struct ItemStore {
    user_id: Option<String>,
    items: HashMap<ItemId, Item>,
    /// temp id -> confirmed id, for callers still holding a temp id
    aliases: HashMap<ItemId, ItemId>,
    alias_order: VecDeque<ItemId>,
    revision: u64,
    changes: broadcast::Sender<StoreChange>,
}

impl ItemStore {
    /// A store without an ownership key is disabled: it accepts nothing.
    pub fn new(user_id: Option<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            user_id: user_id.filter(|id| !id.is_empty()),
            items: HashMap::new(),
            aliases: HashMap::new(),
            alias_order: VecDeque::new(),
            revision: 0,
            changes,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.user_id.is_some()
    }

    fn owns(&self, item: &Item) -> bool {
        self.user_id.as_deref() == Some(item.user_id.as_str())
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn publish(&mut self, change: StoreChange) {
        self.revision += 1;
        // No receivers is fine: nobody is rendering.
        let _ = self.changes.send(change);
    }

    /// Insert or wholesale-replace by id. Returns false (and changes
    /// nothing) for items owned by someone else.
    pub fn upsert(&mut self, item: Item) -> bool {
        if !self.owns(&item) {
            tracing::warn!(id = %item.id, "rejecting item outside the store's ownership scope");
            return false;
        }
        if self.items.get(&item.id) == Some(&item) {
            return true;
        }
        let id = item.id.clone();
        self.items.insert(id.clone(), item);
        self.publish(StoreChange::Upserted(id));
        true
    }

    pub fn remove(&mut self, id: &ItemId) -> Option<Item> {
        let id = self.resolve(id);
        let removed = self.items.remove(&id)?;
        self.forget_aliases_of(&id);
        self.publish(StoreChange::Removed(id));
        Some(removed)
    }

    /// Atomically swap a temp entry for its confirmed copy. Safe to call
    /// after the swap already happened: the first confirmation wins and
    /// later ones change nothing.
    pub fn replace_temp(&mut self, temp: &ItemId, confirmed: Item) -> bool {
        if !self.owns(&confirmed) {
            return false;
        }
        let confirmed_id = confirmed.id.clone();

        if self.items.remove(temp).is_some() {
            self.remember_alias(temp.clone(), confirmed_id.clone());
            self.items.insert(confirmed_id.clone(), confirmed);
            self.publish(StoreChange::Confirmed {
                temp: temp.clone(),
                confirmed: confirmed_id,
            });
            return true;
        }

        match self.aliases.get(temp) {
            Some(existing) if *existing == confirmed_id => true,
            Some(existing) => {
                tracing::warn!(%temp, %existing, duplicate = %confirmed_id, "temp id already confirmed");
                false
            }
            // Temp entry is gone (deleted locally); keep the backend copy
            None => {
                self.remember_alias(temp.clone(), confirmed_id);
                self.upsert(confirmed)
            }
        }
    }

    fn remember_alias(&mut self, temp: ItemId, confirmed: ItemId) {
        if self.aliases.insert(temp.clone(), confirmed).is_none() {
            self.alias_order.push_back(temp);
        }
        while self.alias_order.len() > ALIAS_CAPACITY {
            if let Some(oldest) = self.alias_order.pop_front() {
                self.aliases.remove(&oldest);
            }
        }
    }

    fn forget_aliases_of(&mut self, confirmed: &ItemId) {
        let aliases = &mut self.aliases;
        aliases.retain(|_, target| target != confirmed);
        self.alias_order.retain(|temp| aliases.contains_key(temp));
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    /// Map a temp id that has since been confirmed to its permanent id.
    pub fn resolve(&self, id: &ItemId) -> ItemId {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.items.get(&self.resolve(id))
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn all(&self) -> Vec<Item> {
        self.subset(&ViewFilter::All)
    }

    pub fn subset(&self, filter: &ViewFilter) -> Vec<Item> {
        let mut items: Vec<Item> = self
            .items
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        filter.sort(&mut items);
        items
    }

    /// Find the temp entry a confirmed record stands for: by echoed
    /// `client_key`, or for records without one, by same title within the
    /// match window.
    pub fn find_temp_match(&self, confirmed: &Item, window_ms: i64) -> Option<ItemId> {
        let temps = || self.items.values().filter(|item| item.id.is_temp());

        // A key that matches nothing belongs to another client's create
        if let Some(key) = confirmed.client_key.as_deref() {
            return temps()
                .find(|item| item.client_key.as_deref() == Some(key))
                .map(|item| item.id.clone());
        }

        temps()
            .filter(|item| item.looks_like_echo_of(confirmed, window_ms))
            .min_by_key(|item| {
                (item.created_at - confirmed.created_at)
                    .num_milliseconds()
                    .abs()
            })
            .map(|item| item.id.clone())
    }
}

/// Cheaply cloneable handle to the session's store. Passed explicitly to
/// every component and view; there is no global instance.
#[derive(Clone)]
pub struct SharedItemStore {
    inner: Arc<RwLock<ItemStore>>,
}

impl SharedItemStore {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ItemStore::new(user_id))),
        }
    }

    /// Run a read-only closure against the store
    pub fn read<R>(&self, f: impl FnOnce(&ItemStore) -> R) -> R {
        f(&*self.inner.read())
    }

    /// Run a mutation under one write lock. Nothing inside may await.
    pub fn update<R>(&self, f: impl FnOnce(&mut ItemStore) -> R) -> R {
        f(&mut *self.inner.write())
    }

    pub fn upsert(&self, item: Item) -> bool {
        self.update(|store| store.upsert(item))
    }

    pub fn remove(&self, id: &ItemId) -> Option<Item> {
        self.update(|store| store.remove(id))
    }

    pub fn replace_temp(&self, temp: &ItemId, confirmed: Item) -> bool {
        self.update(|store| store.replace_temp(temp, confirmed))
    }

    pub fn get(&self, id: &ItemId) -> Option<Item> {
        self.read(|store| store.get(id).cloned())
    }

    pub fn resolve(&self, id: &ItemId) -> ItemId {
        self.read(|store| store.resolve(id))
    }

    pub fn all(&self) -> Vec<Item> {
        self.read(|store| store.all())
    }

    pub fn subset(&self, filter: &ViewFilter) -> Vec<Item> {
        self.read(|store| store.subset(filter))
    }

    pub fn len(&self) -> usize {
        self.read(|store| store.len())
    }

    pub fn is_empty(&self) -> bool {
        self.read(|store| store.is_empty())
    }

    pub fn user_id(&self) -> Option<String> {
        self.read(|store| store.user_id().map(str::to_string))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.read(|store| store.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Layer;
    use crate::test_support::{item, local_item, USER};

    fn store() -> ItemStore {
        ItemStore::new(Some(USER.to_string()))
    }

    #[test]
    fn test_upsert_is_idempotent_and_replaces_wholesale() {
        let mut store = store();
        let mut it = item("a", "Call Bob", Layer::Capture);
        it.notes = Some("old".to_string());
        store.upsert(it.clone());
        store.upsert(it.clone());
        assert_eq!(store.len(), 1);
        let revision = store.revision();

        let mut replacement = item("a", "Call Bob", Layer::Capture);
        replacement.notes = None;
        store.upsert(replacement);
        assert_eq!(store.len(), 1);
        assert!(store.get(&it.id).unwrap().notes.is_none());
        assert_eq!(store.revision(), revision + 1);
    }

    #[test]
    fn test_foreign_items_are_rejected() {
        let mut store = store();
        let mut it = item("a", "not mine", Layer::Capture);
        it.user_id = "someone-else".to_string();
        assert!(!store.upsert(it));
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_without_owner_is_disabled() {
        let mut store = ItemStore::new(Some(String::new()));
        assert!(!store.is_enabled());
        assert!(!store.upsert(item("a", "x", Layer::Capture)));
    }

    #[test]
    fn test_subset_is_derived_on_read() {
        let mut store = store();
        store.upsert(item("a", "one", Layer::Capture));
        store.upsert(item("b", "two", Layer::Process));
        store.upsert(item("c", "three", Layer::Process));

        assert_eq!(store.subset(&ViewFilter::Layer(Layer::Process)).len(), 2);

        let mut moved = store.get(&ItemId::confirmed("b")).unwrap().clone();
        moved.layer = Layer::Commit;
        moved.scheduled_at = Some(chrono::Utc::now());
        store.upsert(moved);

        assert_eq!(store.subset(&ViewFilter::Layer(Layer::Process)).len(), 1);
        assert_eq!(store.subset(&ViewFilter::Layer(Layer::Commit)).len(), 1);
        assert_eq!(store.all().len(), 3);
    }

    #[test]
    fn test_replace_temp_leaves_one_entry_and_aliases_old_id() {
        let mut store = store();
        let local = local_item("Call Bob");
        let temp_id = local.id.clone();
        store.upsert(local.clone());

        let mut confirmed = local.clone();
        confirmed.id = ItemId::confirmed("srv-1");
        assert!(store.replace_temp(&temp_id, confirmed.clone()));

        assert_eq!(store.len(), 1);
        assert_eq!(store.resolve(&temp_id), ItemId::confirmed("srv-1"));
        assert_eq!(store.get(&temp_id).unwrap().id, ItemId::confirmed("srv-1"));

        // Second confirmation of the same create is a no-op
        assert!(store.replace_temp(&temp_id, confirmed));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_second_confirmation_under_another_id_is_rejected() {
        let mut store = store();
        let local = local_item("Call Bob");
        let temp_id = local.id.clone();
        store.upsert(local.clone());

        let mut first = local.clone();
        first.id = ItemId::confirmed("srv-1");
        assert!(store.replace_temp(&temp_id, first));

        let mut second = local.clone();
        second.id = ItemId::confirmed("srv-2");
        assert!(!store.replace_temp(&temp_id, second));
        assert_eq!(store.len(), 1);
        assert_eq!(store.resolve(&temp_id), ItemId::confirmed("srv-1"));
    }

    #[test]
    fn test_aliases_are_dropped_with_their_item_and_bounded() {
        let mut store = store();
        let local = local_item("Call Bob");
        let temp_id = local.id.clone();
        store.upsert(local.clone());
        let mut confirmed = local.clone();
        confirmed.id = ItemId::confirmed("srv-1");
        store.replace_temp(&temp_id, confirmed);
        assert_eq!(store.alias_count(), 1);

        store.remove(&temp_id);
        assert_eq!(store.alias_count(), 0);
        assert_eq!(store.resolve(&temp_id), temp_id);

        for n in 0..ALIAS_CAPACITY + 10 {
            let local = local_item("x");
            let temp = local.id.clone();
            store.upsert(local.clone());
            let mut confirmed = local;
            confirmed.id = ItemId::confirmed(format!("srv-{}", n));
            store.replace_temp(&temp, confirmed);
        }
        assert_eq!(store.alias_count(), ALIAS_CAPACITY);
    }

    #[test]
    fn test_find_temp_match_prefers_client_key() {
        let mut store = store();
        let first = local_item("Call Bob");
        let second = local_item("Call Bob");
        store.upsert(first.clone());
        store.upsert(second.clone());

        let mut confirmed = second.clone();
        confirmed.id = ItemId::confirmed("srv-2");
        assert_eq!(store.find_temp_match(&confirmed, 1_000), Some(second.id.clone()));

        confirmed.client_key = None;
        assert!(store.find_temp_match(&confirmed, 1_000).is_some());
    }

    #[test]
    fn test_changes_are_broadcast() {
        let mut store = store();
        let mut rx = store.subscribe();
        store.upsert(item("a", "x", Layer::Capture));
        store.remove(&ItemId::confirmed("a"));
        assert_eq!(rx.try_recv().unwrap(), StoreChange::Upserted(ItemId::confirmed("a")));
        assert_eq!(rx.try_recv().unwrap(), StoreChange::Removed(ItemId::confirmed("a")));
    }
}
