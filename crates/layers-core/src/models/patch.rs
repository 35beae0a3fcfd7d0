use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::layer::Layer;

/// Partial update to an item.
///
/// `None` leaves a field alone. Clearable fields use `Option<Option<_>>`:
/// `Some(None)` clears the field and serializes as an explicit `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub notes: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<Layer>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub destination_id: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub scheduled_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_completed: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub completed_at: Option<Option<DateTime<Utc>>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub archived_at: Option<Option<DateTime<Utc>>>,
}

/// Set of patch fields, used to tell which edits came from where
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PatchFields(u8);

impl PatchFields {
    pub const TITLE: Self = Self(1 << 0);
    pub const NOTES: Self = Self(1 << 1);
    pub const LAYER: Self = Self(1 << 2);
    pub const DESTINATION: Self = Self(1 << 3);
    pub const SCHEDULED_AT: Self = Self(1 << 4);
    pub const IS_COMPLETED: Self = Self(1 << 5);
    pub const COMPLETED_AT: Self = Self(1 << 6);
    pub const ARCHIVED_AT: Self = Self(1 << 7);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

/// Distinguish an explicit `null` (clear) from a missing field (untouched).
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl ItemPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = Some(notes);
        self
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn with_destination(mut self, destination_id: Option<String>) -> Self {
        self.destination_id = Some(destination_id);
        self
    }

    pub fn with_schedule(mut self, scheduled_at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn with_completed(mut self, is_completed: bool) -> Self {
        self.is_completed = Some(is_completed);
        self
    }

    pub fn with_archived(mut self, archived_at: Option<DateTime<Utc>>) -> Self {
        self.archived_at = Some(archived_at);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Which fields this patch sets
    pub fn fields(&self) -> PatchFields {
        let mut fields = PatchFields::empty();
        let mut mark = |set: bool, field: PatchFields| {
            if set {
                fields = fields.union(field);
            }
        };
        mark(self.title.is_some(), PatchFields::TITLE);
        mark(self.notes.is_some(), PatchFields::NOTES);
        mark(self.layer.is_some(), PatchFields::LAYER);
        mark(self.destination_id.is_some(), PatchFields::DESTINATION);
        mark(self.scheduled_at.is_some(), PatchFields::SCHEDULED_AT);
        mark(self.is_completed.is_some(), PatchFields::IS_COMPLETED);
        mark(self.completed_at.is_some(), PatchFields::COMPLETED_AT);
        mark(self.archived_at.is_some(), PatchFields::ARCHIVED_AT);
        fields
    }

    /// Unset `fields`, leaving the rest of the patch alone.
    pub fn clear_fields(&mut self, fields: PatchFields) {
        if fields.contains(PatchFields::TITLE) {
            self.title = None;
        }
        if fields.contains(PatchFields::NOTES) {
            self.notes = None;
        }
        if fields.contains(PatchFields::LAYER) {
            self.layer = None;
        }
        if fields.contains(PatchFields::DESTINATION) {
            self.destination_id = None;
        }
        if fields.contains(PatchFields::SCHEDULED_AT) {
            self.scheduled_at = None;
        }
        if fields.contains(PatchFields::IS_COMPLETED) {
            self.is_completed = None;
        }
        if fields.contains(PatchFields::COMPLETED_AT) {
            self.completed_at = None;
        }
        if fields.contains(PatchFields::ARCHIVED_AT) {
            self.archived_at = None;
        }
    }

    /// Shallow merge: every field set in `later` overwrites ours.
    pub fn merge(&mut self, later: ItemPatch) {
        if later.title.is_some() {
            self.title = later.title;
        }
        if later.notes.is_some() {
            self.notes = later.notes;
        }
        if later.layer.is_some() {
            self.layer = later.layer;
        }
        if later.destination_id.is_some() {
            self.destination_id = later.destination_id;
        }
        if later.scheduled_at.is_some() {
            self.scheduled_at = later.scheduled_at;
        }
        if later.is_completed.is_some() {
            self.is_completed = later.is_completed;
        }
        if later.completed_at.is_some() {
            self.completed_at = later.completed_at;
        }
        if later.archived_at.is_some() {
            self.archived_at = later.archived_at;
        }
    }
}
