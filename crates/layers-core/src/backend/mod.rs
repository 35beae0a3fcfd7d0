//! Request/response and push-subscription collaborators.
//!
//! The core never talks to a server directly; it goes through these traits.
//! `http` provides the reqwest-backed implementations used by the binaries.

pub mod http;
pub mod ndjson;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::auth::Session;
use crate::models::{ChangeNotification, CreateItemPayload, Item, ItemId, ItemPatch};

pub use http::HttpBackend;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Whether a stream yielding this error should be treated as dropped
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BackendError::Network(_) | BackendError::Unauthorized)
    }
}

/// Stream of change notifications for one subscription. Ends when the
/// connection is lost.
pub type ChangeStream = BoxStream<'static, Result<ChangeNotification, BackendError>>;

#[async_trait]
pub trait ItemBackend: Send + Sync {
    async fn update_item(
        &self,
        token: &str,
        id: &ItemId,
        patch: &ItemPatch,
    ) -> Result<Item, BackendError>;

    async fn create_item(
        &self,
        token: &str,
        payload: &CreateItemPayload,
    ) -> Result<Item, BackendError>;

    async fn delete_item(&self, token: &str, id: &ItemId) -> Result<(), BackendError>;
}

/// Push-notification subscription for the `items` collection, filtered
/// server-side to one user.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, token: &str, user_id: &str) -> Result<ChangeStream, BackendError>;
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Session, BackendError>;
}
