//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the backend base URL, request timeout, identity provider settings and the
//! credential storage backend.
//!
//! Configuration is stored at `~/.config/gitkit/config.json`. Any field can be
//! overridden from the environment (`GITKIT_*`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{CredentialStore, FileStore, KeyringStore, DEFAULT_SCOPES};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "gitkit";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// File used by the file credential backend
const CREDENTIALS_FILE: &str = "credentials.json";

pub const DEFAULT_API_BASE_URL: &str = "https://gitkit-backend.onrender.com";

/// Analysis endpoints can take well over a minute.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 100;

/// How often the background task checks whether the identity token needs refreshing
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;

/// Where the two session tokens are persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    /// OS keychain
    #[default]
    Keyring,
    /// JSON file in the config directory
    File,
}

impl std::str::FromStr for CredentialBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            other => anyhow::bail!("Unknown credential backend '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub firebase_api_key: Option<String>,
    pub github_client_id: Option<String>,
    pub scopes: Vec<String>,
    pub credential_backend: CredentialBackend,
    pub refresh_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            firebase_api_key: None,
            github_client_id: None,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            credential_backend: CredentialBackend::default(),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    pub fn credentials_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CREDENTIALS_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Apply `GITKIT_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("GITKIT_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(secs) = var("GITKIT_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("GITKIT_REQUEST_TIMEOUT_SECS is not a number: {}", secs))?;
        }
        if let Some(key) = var("GITKIT_FIREBASE_API_KEY") {
            self.firebase_api_key = Some(key);
        }
        if let Some(id) = var("GITKIT_GITHUB_CLIENT_ID") {
            self.github_client_id = Some(id);
        }
        if let Some(backend) = var("GITKIT_CREDENTIAL_BACKEND") {
            self.credential_backend = backend.parse()?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        if self.request_timeout_secs == 0 {
            warn!("request_timeout_secs is 0, using default");
            return Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS);
        }
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    /// Firebase API key and GitHub OAuth client id, both required to sign in.
    pub fn provider_settings(&self) -> Result<(&str, &str)> {
        let api_key = self
            .firebase_api_key
            .as_deref()
            .context("No Firebase API key configured (set GITKIT_FIREBASE_API_KEY)")?;
        let client_id = self
            .github_client_id
            .as_deref()
            .context("No GitHub OAuth client id configured (set GITKIT_GITHUB_CLIENT_ID)")?;
        Ok((api_key, client_id))
    }

    pub fn credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        Ok(match self.credential_backend {
            CredentialBackend::Keyring => Arc::new(KeyringStore::new()),
            CredentialBackend::File => Arc::new(FileStore::new(Self::credentials_path()?)),
        })
    }
}
