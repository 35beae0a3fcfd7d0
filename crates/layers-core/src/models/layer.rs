use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle stage of an item. Declaration order is lifecycle order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Raw capture, nothing decided yet
    #[default]
    Capture,
    /// Categorized: has a destination
    Process,
    /// Scheduled commitment
    Commit,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Capture, Layer::Process, Layer::Commit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Capture => "capture",
            Layer::Process => "process",
            Layer::Commit => "commit",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
