//! Merge one change notification into the store.
//!
//! Kept free of I/O so the listener's merge rules can be tested without a
//! subscription. The whole merge for one notification happens under a
//! single write lock.
//!
//! A notification never rolls back a local edit that is still waiting to
//! be sent: the caller supplies the pending patch per id and it is laid on
//! top of the incoming record.

use crate::constants::TEMP_MATCH_WINDOW_MS;
use crate::models::{transition, ChangeNotification, Item, ItemId, ItemPatch};
use crate::store::{ItemStore, ViewFilter};

/// What a notification did to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// New item added
    Inserted(ItemId),
    /// Insert for an id already present, typically our own echo
    EchoDropped(ItemId),
    /// Insert replaced the matching optimistic temp entry
    TempConfirmed { temp: ItemId, confirmed: ItemId },
    /// Replaced in place, still matches the open views
    Updated(ItemId),
    /// Replaced, and no longer matches a view it was in
    LeftView(ItemId),
    Removed(ItemId),
    /// Not ours, or the store is disabled
    Ignored(ItemId),
}

impl Reconciled {
    pub fn item_id(&self) -> &ItemId {
        match self {
            Reconciled::Inserted(id)
            | Reconciled::EchoDropped(id)
            | Reconciled::Updated(id)
            | Reconciled::LeftView(id)
            | Reconciled::Removed(id)
            | Reconciled::Ignored(id) => id,
            Reconciled::TempConfirmed { confirmed, .. } => confirmed,
        }
    }
}

/// Pending local patch for an id, if any. Called with the store locked.
pub type PendingLookup<'a> = &'a dyn Fn(&ItemId) -> Option<ItemPatch>;

/// No local writes to protect
pub fn no_pending(_: &ItemId) -> Option<ItemPatch> {
    None
}

pub fn reconcile(
    store: &mut ItemStore,
    scopes: &[ViewFilter],
    notification: ChangeNotification,
    pending: PendingLookup<'_>,
) -> Reconciled {
    let id = notification.item_id().clone();
    let owner_ok = match (store.user_id(), notification.owner()) {
        (None, _) => false,
        (Some(user), Some(owner)) => user == owner,
        // Delete payloads may omit the owner; the subscription is user-scoped.
        (Some(_), None) => true,
    };
    if !owner_ok {
        return Reconciled::Ignored(id);
    }

    match notification {
        ChangeNotification::Insert { record } => {
            apply_insert(store, record.normalized(), pending)
        }
        ChangeNotification::Update { record } => {
            apply_update(store, scopes, record.normalized(), pending)
        }
        ChangeNotification::Delete { record } => {
            // Deleting an unknown id is a no-op
            store.remove(&record.id);
            Reconciled::Removed(id)
        }
    }
}

fn apply_insert(store: &mut ItemStore, record: Item, pending: PendingLookup<'_>) -> Reconciled {
    let id = record.id.clone();
    if store.contains(&id) {
        return Reconciled::EchoDropped(id);
    }
    if let Some(temp) = store.find_temp_match(&record, TEMP_MATCH_WINDOW_MS) {
        // Edits to the temp entry are still keyed by the temp id here
        let record = transition::overlay(record, pending(&temp).as_ref());
        store.replace_temp(&temp, record);
        return Reconciled::TempConfirmed {
            temp,
            confirmed: id,
        };
    }
    store.upsert(record);
    Reconciled::Inserted(id)
}

fn apply_update(
    store: &mut ItemStore,
    scopes: &[ViewFilter],
    record: Item,
    pending: PendingLookup<'_>,
) -> Reconciled {
    let id = record.id.clone();
    let previous = store.get(&id).cloned();

    // Archived items drop out of every active view.
    if record.is_archived() {
        store.remove(&id);
        return Reconciled::Removed(id);
    }

    let record = transition::overlay(record, pending(&id).as_ref());
    let left = previous.is_some_and(|previous| {
        scopes
            .iter()
            .any(|scope| scope.matches(&previous) && !scope.matches(&record))
    });
    store.upsert(record);
    if left {
        Reconciled::LeftView(id)
    } else {
        Reconciled::Updated(id)
    }
}
