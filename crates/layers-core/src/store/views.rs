use chrono::{DateTime, Utc};

use crate::models::{Item, Layer};

/// Predicate a view derives its subset with. Views never own items; they
/// re-run their filter against the store on every read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewFilter {
    /// Every non-archived item
    All,
    /// Active items in one layer
    Layer(Layer),
    /// Active items filed under a destination
    Destination(String),
    /// Active scheduled items with `start <= scheduled_at < end`
    ScheduledBetween {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Completed, non-archived items
    Completed,
}

impl ViewFilter {
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            ViewFilter::All => !item.is_archived(),
            ViewFilter::Layer(layer) => item.is_active() && item.layer == *layer,
            ViewFilter::Destination(id) => {
                item.is_active() && item.destination_id.as_deref() == Some(id.as_str())
            }
            ViewFilter::ScheduledBetween { start, end } => {
                item.is_active()
                    && item.layer == Layer::Commit
                    && item
                        .scheduled_at
                        .is_some_and(|at| *start <= at && at < *end)
            }
            ViewFilter::Completed => item.is_completed && !item.is_archived(),
        }
    }

    /// Sort a derived subset in place. Schedule views read chronologically,
    /// everything else newest first.
    pub fn sort(&self, items: &mut [Item]) {
        match self {
            ViewFilter::Layer(Layer::Commit) | ViewFilter::ScheduledBetween { .. } => {
                items.sort_by(|a, b| {
                    a.scheduled_at
                        .cmp(&b.scheduled_at)
                        .then_with(|| a.created_at.cmp(&b.created_at))
                        .then_with(|| a.id.cmp(&b.id))
                });
            }
            ViewFilter::Completed => {
                items.sort_by(|a, b| {
                    b.completed_at
                        .cmp(&a.completed_at)
                        .then_with(|| a.id.cmp(&b.id))
                });
            }
            _ => {
                items.sort_by(|a, b| {
                    b.created_at
                        .cmp(&a.created_at)
                        .then_with(|| a.id.cmp(&b.id))
                });
            }
        }
    }
}
