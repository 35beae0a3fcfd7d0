//! Layer state machine.
//!
//! Every write to an item goes through [`apply`], which takes the fields the
//! caller wants to change and adds the layer change those fields imply.
//! Callers never compute the layer themselves.
//!
//! * `capture -> process` when a destination is set on a capture item
//! * `capture | process -> commit` when a schedule is set
//! * `commit -> process` only when the schedule is cleared (unschedule)
//! * completion and archival are flags, orthogonal to the layer

use chrono::{DateTime, Utc};

use super::item::Item;
use super::layer::Layer;
use super::patch::ItemPatch;

/// Finalize `proposed` against `current`, returning the payload to persist.
pub fn apply(current: &Item, proposed: ItemPatch) -> ItemPatch {
    let mut patch = proposed;

    match patch.is_completed {
        Some(true) if patch.completed_at.is_none() && !current.is_completed => {
            patch.completed_at = Some(Some(Utc::now()));
        }
        Some(false) if patch.completed_at.is_none() && current.completed_at.is_some() => {
            patch.completed_at = Some(None);
        }
        _ => {}
    }

    // A schedule always wins: commit from any layer.
    if let Some(Some(_)) = patch.scheduled_at {
        patch.layer = Some(Layer::Commit);
        return patch;
    }

    let scheduled_after = match patch.scheduled_at {
        Some(cleared) => cleared,
        None => current.scheduled_at,
    };

    // Asking a scheduled item to leave commit is an unschedule.
    if scheduled_after.is_some() {
        match patch.layer {
            Some(Layer::Process) => {
                patch.scheduled_at = Some(None);
                return patch;
            }
            Some(_) => patch.layer = None,
            None => {}
        }
        return patch;
    }

    let mut layer = patch.layer.unwrap_or(current.layer);

    // Never regress to capture once the item has moved on.
    if layer < current.layer && layer == Layer::Capture {
        layer = current.layer;
    }
    // Commit without a date is not a resting state.
    if layer == Layer::Commit {
        layer = Layer::Process;
    }

    let destination_set = matches!(patch.destination_id, Some(Some(_)));
    if destination_set && layer == Layer::Capture {
        layer = Layer::Process;
    }

    patch.layer = if layer != current.layer || patch.layer.is_some() {
        Some(layer)
    } else {
        None
    };
    patch
}

/// `item` with a not yet persisted patch laid on top. Used when a backend
/// copy replaces the local one while local edits are still waiting.
pub fn overlay(mut item: Item, pending: Option<&ItemPatch>) -> Item {
    if let Some(patch) = pending {
        let finalized = apply(&item, patch.clone());
        item.apply_patch(&finalized);
    }
    item
}

/// Categorize an item; moves a capture item to `process`.
pub fn assign_destination(destination_id: impl Into<String>) -> ItemPatch {
    ItemPatch::new().with_destination(Some(destination_id.into()))
}

/// Schedule an item; moves it to `commit`.
pub fn schedule_for(at: DateTime<Utc>) -> ItemPatch {
    ItemPatch::new().with_schedule(Some(at))
}

/// The explicit `commit -> process` move.
pub fn unschedule() -> ItemPatch {
    ItemPatch::new()
        .with_schedule(None)
        .with_layer(Layer::Process)
}

pub fn complete() -> ItemPatch {
    ItemPatch::new().with_completed(true)
}

pub fn reopen() -> ItemPatch {
    ItemPatch::new().with_completed(false)
}

pub fn archive() -> ItemPatch {
    ItemPatch::new().with_archived(Some(Utc::now()))
}
