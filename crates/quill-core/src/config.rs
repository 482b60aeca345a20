//! Configuration system for Quill.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $QUILL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/quill/config.toml
//!   3. ~/.config/quill/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuillConfig {
    pub relay: RelayConfig,
    pub agent: AgentConfig,
    pub files: FilesConfig,
}

/// Relay server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// TCP listen address. Port 0 = OS-assigned.
    pub listen_addr: String,
    /// Root of the persisted queue store.
    pub store_dir: PathBuf,
    /// Path to the relay's transport keypair. Auto-generated on first run.
    pub keypair_path: PathBuf,
    /// Max undelivered messages per queue before the quota marker.
    pub quota: usize,
    /// Message time-to-live in seconds. 0 = never expire.
    pub ttl_secs: u64,
    /// Expiration sweep interval in seconds.
    pub check_interval_secs: u64,
    /// Messages per journal file before rotation.
    pub max_journal_msg_count: u64,
    /// State-log lines before compaction.
    pub max_state_lines: u64,
    /// Largest accepted file chunk body in bytes.
    pub max_chunk_size: u64,
    /// Bound of each session's outbound delivery queue.
    pub session_queue_len: usize,
}

/// Connection agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Relay addresses (`quill://fp@host:port`) the agent may use.
    pub relays: Vec<String>,
    /// Give up on a join handshake after this many seconds.
    pub hello_timeout_secs: u64,
    /// Retry profile for interactive operations.
    pub retry_fast: RetryConfig,
    /// Retry profile for background delivery.
    pub retry_slow: RetryConfig,
}

/// A bounded exponential-backoff profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    /// Numerator over 10: 15 = ×1.5 per attempt.
    pub growth_tenths: u64,
    pub max_consecutive_retries: u32,
}

impl RetryConfig {
    /// Delay before attempt `n` (0-based), capped at `max_ms`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let mut delay = self.initial_ms;
        for _ in 0..attempt {
            delay = (delay.saturating_mul(self.growth_tenths) / 10).min(self.max_ms);
            if delay == self.max_ms {
                break;
            }
        }
        delay.min(self.max_ms)
    }
}

/// File transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Default chunk size in bytes.
    pub default_chunk_size: u64,
    /// Small chunk size for short tails.
    pub small_chunk_size: u64,
    /// Temp prefix for encrypted artifacts.
    pub temp_dir: PathBuf,
    /// Ceiling on bytes in flight across all upload workers.
    pub max_inflight_bytes: u64,
    /// Largest descriptor that still fits a QR code; larger ones redirect.
    pub qr_budget: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "[::]:5223".to_string(),
            store_dir: data_dir().join("relay"),
            keypair_path: config_dir().join("relay_keypair"),
            quota: 128,
            ttl_secs: 21 * 24 * 3600,
            check_interval_secs: 3600,
            max_journal_msg_count: 1024,
            max_state_lines: 512,
            max_chunk_size: 8 * 1024 * 1024 + 16 * 1024,
            session_queue_len: 64,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            hello_timeout_secs: 300,
            retry_fast: RetryConfig {
                initial_ms: 200,
                max_ms: 10_000,
                growth_tenths: 30,
                max_consecutive_retries: 5,
            },
            retry_slow: RetryConfig {
                initial_ms: 2_000,
                max_ms: 300_000,
                growth_tenths: 20,
                max_consecutive_retries: 10,
            },
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: 200,
            max_ms: 10_000,
            growth_tenths: 30,
            max_consecutive_retries: 5,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 8 * 1024 * 1024,
            small_chunk_size: 1024 * 1024,
            temp_dir: data_dir().join("files_tmp"),
            max_inflight_bytes: 64 * 1024 * 1024,
            qr_budget: 1002,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("quill")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("quill")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl QuillConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            QuillConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("QUILL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&QuillConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply QUILL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("QUILL_RELAY__LISTEN_ADDR") {
            self.relay.listen_addr = v;
        }
        if let Ok(v) = std::env::var("QUILL_RELAY__STORE_DIR") {
            self.relay.store_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("QUILL_RELAY__QUOTA") {
            if let Ok(n) = v.parse() {
                self.relay.quota = n;
            }
        }
        if let Ok(v) = std::env::var("QUILL_RELAY__TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.relay.ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("QUILL_AGENT__RELAYS") {
            self.agent.relays = v.split(',').map(str::to_string).collect();
        }
        if let Ok(v) = std::env::var("QUILL_FILES__TEMP_DIR") {
            self.files.temp_dir = PathBuf::from(v);
        }
    }
}
