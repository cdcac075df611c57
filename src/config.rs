//! Configuration loading and persistence.
//!
//! Handles reading and writing the herald configuration file. The token
//! is never written to `config.json`; it lives in a separate owner-only
//! `token` file or comes from `HERALD_TOKEN`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::{Credential, ReconnectPolicy};
use crate::constants::{
    CACHE_CAPACITY, CACHE_FILE_NAME, RECONNECT_BASE_DELAY, RECONNECT_MAX_ATTEMPTS,
    RECONNECT_MAX_DELAY, SYSTEM_NOTIFICATION_DISMISS,
};

const CONFIG_FILE_NAME: &str = "config.json";
const TOKEN_FILE_NAME: &str = "token";

/// Reconnect backoff settings.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any retry delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Consecutive failures before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: duration_ms(RECONNECT_BASE_DELAY),
            max_delay_ms: duration_ms(RECONNECT_MAX_DELAY),
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectConfig {
    /// Backoff policy for the connection manager.
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration for the herald CLI.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Base URL of the notification server.
    pub server_url: String,
    /// API token - NOT serialized to config.json.
    #[serde(skip)]
    pub token: String,
    /// Role used to pick the notification room.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Maximum number of notifications kept locally.
    pub cache_capacity: usize,
    /// Where the local cache is stored (defaults to the config dir).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Delay before non-critical system notifications are dismissed.
    pub system_dismiss_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            token: String::new(),
            role: None,
            cache_capacity: CACHE_CAPACITY,
            cache_path: None,
            reconnect: ReconnectConfig::default(),
            system_dismiss_ms: duration_ms(SYSTEM_NOTIFICATION_DISMISS),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `HERALD_CONFIG_DIR` overrides the platform config dir
    /// (e.g. `~/.config/herald`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = match std::env::var("HERALD_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("herald"),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config dir, with environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_dir(&Self::config_dir()?)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads `config.json` and the token file from `dir`. Missing files
    /// yield defaults.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))?
        } else {
            Self::default()
        };

        let token_path = dir.join(TOKEN_FILE_NAME);
        if token_path.exists() {
            config.token = fs::read_to_string(&token_path)
                .with_context(|| format!("Failed to read {}", token_path.display()))?
                .trim()
                .to_string();
        }

        if config.cache_path.is_none() {
            config.cache_path = Some(dir.join(CACHE_FILE_NAME));
        }
        Ok(config)
    }

    /// Apply `HERALD_*` overrides. Unparseable numbers are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("HERALD_SERVER_URL") {
            self.server_url = server_url;
        }

        // Token from env var (for CI/CD)
        if let Some(token) = lookup("HERALD_TOKEN") {
            self.token = token;
        }

        if let Some(role) = lookup("HERALD_ROLE") {
            self.role = Some(role).filter(|r| !r.is_empty());
        }

        if let Some(capacity) = lookup("HERALD_CACHE_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<usize>() {
                self.cache_capacity = capacity;
            }
        }

        if let Some(attempts) = lookup("HERALD_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse::<u32>() {
                self.reconnect.max_attempts = attempts;
            }
        }

        if let Some(base) = lookup("HERALD_RECONNECT_BASE_MS") {
            if let Ok(base) = base.parse::<u64>() {
                self.reconnect.base_delay_ms = base;
            }
        }
    }

    /// Persists the current configuration to disk.
    /// Note: Token is NOT saved here (use `save_token` for that).
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(&Self::config_dir()?)
    }

    /// Writes `config.json` into `dir`.
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        write_private(&config_path, &serde_json::to_string_pretty(self)?)
    }

    /// Store a new token next to the config.
    pub fn save_token(&mut self, dir: &Path, token: &str) -> Result<()> {
        self.token = token.trim().to_string();
        write_private(&dir.join(TOKEN_FILE_NAME), &self.token)
    }

    /// Remove the stored token.
    pub fn clear_token(&mut self, dir: &Path) -> Result<()> {
        self.token.clear();
        let token_path = dir.join(TOKEN_FILE_NAME);
        if token_path.exists() {
            fs::remove_file(&token_path)
                .with_context(|| format!("Failed to remove {}", token_path.display()))?;
        }
        Ok(())
    }

    /// Check if we have an authentication token.
    pub fn has_token(&self) -> bool {
        !self.token.trim().is_empty()
    }

    /// Credential for the push connection.
    pub fn credential(&self) -> Credential {
        let credential = Credential::new(self.token.clone());
        match &self.role {
            Some(role) => credential.with_role(role.clone()),
            None => credential,
        }
    }

    /// Delay before non-critical system notifications are dismissed.
    pub fn system_dismiss(&self) -> Duration {
        Duration::from_millis(self.system_dismiss_ms)
    }

    /// Update one setting by key, as used by `herald config <key> <value>`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let number = |v: &str| -> Result<u64> {
            v.parse::<u64>()
                .with_context(|| format!("'{v}' is not a number"))
        };
        match key {
            "server_url" => self.server_url = value.to_string(),
            "role" => self.role = Some(value.to_string()).filter(|r| !r.is_empty()),
            "cache_capacity" => {
                self.cache_capacity = usize::try_from(number(value)?)
                    .context("cache_capacity out of range")?;
            }
            "cache_path" => self.cache_path = Some(PathBuf::from(value)),
            "reconnect.base_delay_ms" => self.reconnect.base_delay_ms = number(value)?,
            "reconnect.max_delay_ms" => self.reconnect.max_delay_ms = number(value)?,
            "reconnect.max_attempts" => {
                self.reconnect.max_attempts =
                    u32::try_from(number(value)?).context("max_attempts out of range")?;
            }
            "system_dismiss_ms" => self.system_dismiss_ms = number(value)?,
            other => anyhow::bail!("Unknown config key '{other}'"),
        }
        Ok(())
    }
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;

    // Set restrictive permissions (owner read/write only)
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}
