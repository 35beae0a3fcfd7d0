pub mod item_store;
pub mod views;

pub use item_store::{ItemStore, SharedItemStore, StoreChange};
pub use views::ViewFilter;
