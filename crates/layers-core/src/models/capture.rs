use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::item::CaptureSource;
use crate::constants::{DEFAULT_TITLE, MAX_TITLE_CHARS};

/// A capture waiting in the offline queue. It has no item id; the backend
/// assigns one on delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedCapture {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    /// Idempotency key sent with every delivery attempt of this capture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

impl QueuedCapture {
    pub fn new(title: String, notes: Option<String>) -> Self {
        Self {
            title,
            notes,
            enqueued_at: Utc::now(),
            client_key: Some(Uuid::new_v4().to_string()),
        }
    }

    /// Split free text into a capture: first line is the title, the rest
    /// (if any) becomes notes.
    pub fn from_text(text: &str) -> Self {
        let (title, notes) = split_capture_text(text);
        Self::new(title, notes)
    }

    pub fn to_payload(&self) -> CreateItemPayload {
        CreateItemPayload {
            title: self.title.clone(),
            notes: self.notes.clone(),
            source: CaptureSource::CaptureClient,
            client_key: self.client_key.clone(),
        }
    }
}

/// Body of a create request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateItemPayload {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub source: CaptureSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

/// Derive title and notes from captured text
pub fn split_capture_text(text: &str) -> (String, Option<String>) {
    let trimmed = text.trim();
    let (first, rest) = match trimmed.split_once('\n') {
        Some((first, rest)) => (first, rest.trim()),
        None => (trimmed, ""),
    };

    let title: String = first.trim().chars().take(MAX_TITLE_CHARS).collect();
    let title = if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    };
    let notes = (!rest.is_empty()).then(|| rest.to_string());
    (title, notes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_capture() {
        assert_eq!(split_capture_text("  buy milk \n"), ("buy milk".to_string(), None));
    }

    #[test]
    fn test_multi_line_capture_keeps_notes() {
        let (title, notes) = split_capture_text("Call Bob\nabout the lease\nbefore Friday");
        assert_eq!(title, "Call Bob");
        assert_eq!(notes.as_deref(), Some("about the lease\nbefore Friday"));
    }

    #[test]
    fn test_long_title_is_truncated() {
        let text = "x".repeat(MAX_TITLE_CHARS + 40);
        let (title, _) = split_capture_text(&text);
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_payload_carries_capture_client_source() {
        let capture = QueuedCapture::from_text("buy milk");
        let payload = capture.to_payload();
        assert_eq!(payload.source, CaptureSource::CaptureClient);
        assert_eq!(payload.client_key, capture.client_key);
    }
}
