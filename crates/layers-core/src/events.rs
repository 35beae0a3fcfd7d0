use crate::models::ItemId;
use crate::sync::{ListenerState, Reconciled};

/// Save-state signal for UI feedback
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SaveStatus {
    #[default]
    Idle,
    Saving,
    Saved,
    Error(String),
}

impl SaveStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, SaveStatus::Error(_))
    }
}

/// Background-sync events. Failures surface here instead of as errors in
/// the caller's path.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A local create was confirmed by the backend
    ItemConfirmed { temp: ItemId, confirmed: ItemId },
    /// A write for this item failed and was not retried
    SaveFailed { id: ItemId, message: String },
    /// A change notification was merged into the store
    Reconciled(Reconciled),
    ListenerState(ListenerState),
    /// Refresh failed; automatic writes are halted until sign-in
    SessionExpired,
}
