pub mod coordinator;
pub mod realtime;
pub mod reconcile;

pub use coordinator::{EditSource, FlushOutcome, PersistenceCoordinator};
pub use realtime::{ListenerContext, ListenerState, ReconciliationListener, ViewScopes};
pub use reconcile::{no_pending, reconcile, PendingLookup, Reconciled};
