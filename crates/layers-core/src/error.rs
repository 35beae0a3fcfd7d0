use crate::auth::{AuthError, RequestError};
use crate::backend::BackendError;
use crate::capture::QueueStorageError;
use crate::models::ItemId;

/// Errors surfaced by [`crate::runtime::LayersCore`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("No user configured; the item store is disabled")]
    NoOwner,
    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Storage(#[from] QueueStorageError),
}

impl From<AuthError> for CoreError {
    fn from(e: AuthError) -> Self {
        CoreError::Request(RequestError::Auth(e))
    }
}

impl From<BackendError> for CoreError {
    fn from(e: BackendError) -> Self {
        CoreError::Request(RequestError::Backend(e))
    }
}
