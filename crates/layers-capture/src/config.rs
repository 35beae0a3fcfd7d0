use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use layers_core::constants::CONFIG_FILE;
use layers_core::{CoreConfig, FileSessionStore, KeyringSessionStore, SessionStore};
use serde::{Deserialize, Serialize};

/// Keyring account used when no user id is configured
const DEFAULT_ACCOUNT: &str = "default";

/// Where the session tokens live between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    Keyring,
    /// Plain JSON file in the data directory, for machines without a keyring
    File,
}

/// Capture CLI configuration that can be loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    #[serde(flatten)]
    pub core: CoreConfig,

    #[serde(default)]
    pub session_store: SessionBackend,
}

impl CaptureConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CaptureConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Explicit path, else `config.json` in the default data dir if present,
    /// else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let implicit = layers_core::config::default_data_dir().join(CONFIG_FILE);
        if implicit.exists() {
            return Self::load(&implicit);
        }
        Ok(Self::default())
    }

    /// Command-line flags win over the file
    pub fn apply_overrides(
        &mut self,
        data_dir: Option<PathBuf>,
        api_url: Option<String>,
        file_session: bool,
    ) {
        if let Some(dir) = data_dir {
            self.core.data_dir = dir;
        }
        if let Some(url) = api_url {
            self.core.api_base_url = url;
        }
        if file_session {
            self.session_store = SessionBackend::File;
        }
    }

    pub fn session_store(&self) -> Arc<dyn SessionStore> {
        match self.session_store {
            SessionBackend::Keyring => {
                let account = self.core.user_id.as_deref().unwrap_or(DEFAULT_ACCOUNT);
                Arc::new(KeyringSessionStore::new(account))
            }
            SessionBackend::File => Arc::new(FileSessionStore::new(self.core.session_path())),
        }
    }
}
