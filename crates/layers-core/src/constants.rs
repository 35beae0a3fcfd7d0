//! Application-wide constants
//!
//! Centralized location for magic strings and tuning values that are used
//! across multiple modules.

/// Default backend base URL
pub const API_BASE_URL: &str = "http://localhost:8787";

/// Prefix of locally assigned placeholder ids
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Quiet period before a debounced edit is sent
pub const DEFAULT_DEBOUNCE_MS: u64 = 400;

/// How long the `saved` status is shown before settling back to `idle`
pub const SAVED_SETTLE_MS: u64 = 1_500;

/// Temp items and confirmed inserts created this close together (with the
/// same title) are considered the same item.
pub const TEMP_MATCH_WINDOW_MS: i64 = 1_000;

/// Tokens closer than this to expiry are refreshed before use
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 30;

// Resubscribe backoff
pub const RESUBSCRIBE_INITIAL_MS: u64 = 500;
pub const RESUBSCRIBE_MAX_MS: u64 = 30_000;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;

/// Longest change-stream line held in memory; longer ones are skipped
pub const MAX_CHANGE_LINE_BYTES: usize = 1024 * 1024;

// Capture defaults
pub const DEFAULT_TITLE: &str = "Untitled";
pub const MAX_TITLE_CHARS: usize = 120;

// Files inside the data directory
pub const CAPTURE_QUEUE_FILE: &str = "capture_queue.json";
pub const SESSION_FILE: &str = "session.json";
pub const CONFIG_FILE: &str = "config.json";

/// Service name under which sessions are stored in the OS keyring
pub const KEYRING_SERVICE: &str = "com.layers.capture";
