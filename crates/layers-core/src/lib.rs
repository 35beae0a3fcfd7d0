pub mod auth;
pub mod backend;
pub mod capture;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod models;
pub mod runtime;
pub mod secure_storage;
pub mod stats;
pub mod store;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use auth::{
    FileSessionStore, MemorySessionStore, RequestError, Session, SessionManager, SessionState,
    SessionStore,
};
pub use capture::{DrainReport, OfflineCaptureQueue, SubmitOutcome};
pub use config::CoreConfig;
pub use error::CoreError;
pub use events::{CoreEvent, SaveStatus};
pub use runtime::{CoreServices, LayersCore, ViewHandle};
pub use secure_storage::KeyringSessionStore;
