pub mod capture;
pub mod change;
pub mod item;
pub mod layer;
pub mod patch;
pub mod transition;

pub use capture::{split_capture_text, CreateItemPayload, QueuedCapture};
pub use change::{ChangeKind, ChangeNotification, DeletedRecord};
pub use item::{CaptureSource, Item, ItemId};
pub use layer::Layer;
pub use patch::{ItemPatch, PatchFields};
