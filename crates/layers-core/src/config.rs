use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    API_BASE_URL, CAPTURE_QUEUE_FILE, DEFAULT_DEBOUNCE_MS, DEFAULT_REQUEST_TIMEOUT_SECS,
    RESUBSCRIBE_INITIAL_MS, RESUBSCRIBE_MAX_MS, SESSION_FILE,
};

/// Capped exponential backoff used between resubscribe attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl BackoffConfig {
    /// Delay before attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_ms.saturating_mul(factor).min(self.max_ms))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: RESUBSCRIBE_INITIAL_MS,
            max_ms: RESUBSCRIBE_MAX_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub api_base_url: String,
    /// Ownership key. Without it the store and listener stay disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub debounce_ms: u64,
    pub request_timeout_secs: u64,
    pub resubscribe: BackoffConfig,
}

impl CoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CoreConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join(CAPTURE_QUEUE_FILE)
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE)
    }
}

/// Platform data directory, falling back to a relative one
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("layers"))
        .unwrap_or_else(|| PathBuf::from("layers_data"))
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_base_url: API_BASE_URL.to_string(),
            user_id: None,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            resubscribe: BackoffConfig::default(),
        }
    }
}
