use serde::{Deserialize, Serialize};
use std::fmt;

use super::item::{Item, ItemId};

/// Payload of a delete notification. Backends typically only send the key
/// columns of the removed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedRecord {
    pub id: ItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// One mutation of the `items` collection pushed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeNotification {
    Insert { record: Item },
    Update { record: Item },
    Delete { record: DeletedRecord },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => f.write_str("insert"),
            ChangeKind::Update => f.write_str("update"),
            ChangeKind::Delete => f.write_str("delete"),
        }
    }
}

impl ChangeNotification {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeNotification::Insert { .. } => ChangeKind::Insert,
            ChangeNotification::Update { .. } => ChangeKind::Update,
            ChangeNotification::Delete { .. } => ChangeKind::Delete,
        }
    }

    pub fn item_id(&self) -> &ItemId {
        match self {
            ChangeNotification::Insert { record } | ChangeNotification::Update { record } => {
                &record.id
            }
            ChangeNotification::Delete { record } => &record.id,
        }
    }

    /// Owner of the affected record, when the payload carries one
    pub fn owner(&self) -> Option<&str> {
        match self {
            ChangeNotification::Insert { record } | ChangeNotification::Update { record } => {
                Some(record.user_id.as_str())
            }
            ChangeNotification::Delete { record } => record.user_id.as_deref(),
        }
    }
}
