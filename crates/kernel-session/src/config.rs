//! Client settings for kernel connections.
//!
//! Settings are stored as JSON in the user's config directory:
//! - macOS: ~/Library/Application Support/nbexec/settings.json
//! - Linux: ~/.config/nbexec/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\nbexec\settings.json
//!
//! Durations are stored in milliseconds. A missing or unparsable file falls
//! back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnect schedule for the connection channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            max_retries: Some(10),
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt `attempt` (zero-based):
    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Whether attempt `attempt` (zero-based) is still allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.map_or(true, |max| attempt < max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelClientConfig {
    pub backoff: BackoffConfig,

    /// How long requests issued before a disconnect stay pending. `None`
    /// holds them until restart or shutdown, `Some(0)` fails them at once.
    pub disconnect_grace_ms: Option<u64>,

    /// Upper bound for the `kernel_info` handshake behind `Session::ready`.
    pub handshake_timeout_ms: u64,

    /// Default per-request timeout; `None` waits indefinitely.
    pub request_timeout_ms: Option<u64>,

    /// Username stamped on outgoing headers.
    pub username: String,
}

impl Default for KernelClientConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            disconnect_grace_ms: Some(30_000),
            handshake_timeout_ms: 10_000,
            request_timeout_ms: None,
            username: "nbexec".to_string(),
        }
    }
}

impl KernelClientConfig {
    pub fn disconnect_grace(&self) -> Option<Duration> {
        self.disconnect_grace_ms.map(Duration::from_millis)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Path of the settings file.
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nbexec")
        .join("settings.json")
}

/// Load settings from the default location.
pub fn load_settings() -> KernelClientConfig {
    load_settings_from(&settings_path())
}

/// Load settings from `path`, returning defaults if it is missing or invalid.
pub fn load_settings_from(path: &Path) -> KernelClientConfig {
    if !path.exists() {
        return KernelClientConfig::default();
    }
    match std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
    {
        Ok(config) => config,
        Err(e) => {
            log::warn!(
                "[config] Ignoring unreadable settings at {}: {}",
                path.display(),
                e
            );
            KernelClientConfig::default()
        }
    }
}

/// Save settings to `path`, creating parent directories.
pub fn save_settings_to(path: &Path, config: &KernelClientConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)
}
