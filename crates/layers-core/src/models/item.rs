use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::layer::Layer;
use super::patch::ItemPatch;
use crate::constants::TEMP_ID_PREFIX;

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(1);

/// Item identifier.
///
/// Locally created items carry a `Temp` id (`tmp-<n>`) until the backend
/// confirms the create and hands back the permanent id. On the wire both
/// variants are plain strings; the prefix tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemId {
    Temp(String),
    Confirmed(String),
}

impl ItemId {
    /// Allocate a fresh temporary id for an optimistic insert
    pub fn temp() -> Self {
        let n = NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed);
        ItemId::Temp(format!("{}{}", TEMP_ID_PREFIX, n))
    }

    pub fn confirmed(id: impl Into<String>) -> Self {
        ItemId::Confirmed(id.into())
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, ItemId::Temp(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ItemId::Temp(id) | ItemId::Confirmed(id) => id,
        }
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        if value.starts_with(TEMP_ID_PREFIX) {
            ItemId::Temp(value)
        } else {
            ItemId::Confirmed(value)
        }
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        ItemId::from(value.to_string())
    }
}

impl From<ItemId> for String {
    fn from(value: ItemId) -> Self {
        match value {
            ItemId::Temp(id) | ItemId::Confirmed(id) => id,
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a create request originated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    #[default]
    App,
    CaptureClient,
    Import,
}

/// A work item. The backend holds the authoritative record; this is the
/// client-side copy, serialized with the backend's camelCase field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    /// Ownership key
    pub user_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub layer: Layer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Display only, never used to order writes
    pub updated_at: DateTime<Utc>,
    /// Idempotency key attached to creates and echoed back by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(default)]
    pub source: CaptureSource,
}

impl Item {
    /// Build an optimistic, not-yet-confirmed item in the capture layer
    pub fn new_local(
        user_id: impl Into<String>,
        title: impl Into<String>,
        notes: Option<String>,
        source: CaptureSource,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::temp(),
            user_id: user_id.into(),
            title: title.into(),
            notes,
            layer: Layer::Capture,
            destination_id: None,
            scheduled_at: None,
            is_completed: false,
            completed_at: None,
            archived_at: None,
            created_at: now,
            updated_at: now,
            client_key: Some(Uuid::new_v4().to_string()),
            source,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Active items show up in the per-layer views
    pub fn is_active(&self) -> bool {
        !self.is_completed && !self.is_archived()
    }

    /// Apply an already-finalized patch (see `transition::apply`).
    pub fn apply_patch(&mut self, patch: &ItemPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(notes) = &patch.notes {
            self.notes = notes.clone();
        }
        if let Some(layer) = patch.layer {
            self.layer = layer;
        }
        if let Some(destination_id) = &patch.destination_id {
            self.destination_id = destination_id.clone();
        }
        if let Some(scheduled_at) = patch.scheduled_at {
            self.scheduled_at = scheduled_at;
        }
        if let Some(is_completed) = patch.is_completed {
            self.is_completed = is_completed;
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = completed_at;
        }
        if let Some(archived_at) = patch.archived_at {
            self.archived_at = archived_at;
        }
        self.updated_at = Utc::now();
    }

    /// Bring the layer in line with the fields that imply it. Only forward
    /// implications are applied: a schedule means `commit`, a destination on
    /// a capture item means `process`.
    pub fn normalized(mut self) -> Self {
        if self.scheduled_at.is_some() {
            self.layer = Layer::Commit;
        } else if self.destination_id.is_some() && self.layer == Layer::Capture {
            self.layer = Layer::Process;
        }
        self
    }

    /// Whether `other` plausibly is the backend's copy of this temp item:
    /// same owner, same title, created within the same second.
    pub fn looks_like_echo_of(&self, other: &Item, window_ms: i64) -> bool {
        self.user_id == other.user_id
            && self.title == other.title
            && (self.created_at - other.created_at).num_milliseconds().abs() < window_ms
    }
}
