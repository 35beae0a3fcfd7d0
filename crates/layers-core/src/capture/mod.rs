//! Offline capture: a durable FIFO of captures for clients that are often
//! disconnected.

pub mod queue;
pub mod storage;

pub use queue::{DrainReport, OfflineCaptureQueue, SubmitOutcome};
pub use storage::{QueueStorage, QueueStorageError};
