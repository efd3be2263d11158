use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/wasend.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the per-device credential directories
    pub sessions_dir: String,
    /// Temporary attachment uploads, deleted after dispatch
    pub attachments_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sessions_dir: "./data/sessions".to_string(),
            attachments_dir: "./data/uploads".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Unscanned QR codes destroy the session after this long
    #[serde(default = "default_qr_timeout_secs")]
    pub qr_timeout_secs: u64,
    /// How long `start` waits for the first QR before returning without one
    #[serde(default = "default_qr_wait_secs")]
    pub qr_wait_secs: u64,
    /// Grace delay before on-disk credentials of a closed session are removed
    #[serde(default = "default_credential_purge_delay_ms")]
    pub credential_purge_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// How long dispatch waits for an on-demand resume to authenticate
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

fn default_qr_timeout_secs() -> u64 { 60 }
fn default_qr_wait_secs() -> u64 { 20 }
fn default_credential_purge_delay_ms() -> u64 { 1000 }
fn default_max_reconnect_attempts() -> u32 { 5 }
fn default_reconnect_base_delay_ms() -> u64 { 500 }
fn default_ready_timeout_secs() -> u64 { 15 }

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            qr_timeout_secs: default_qr_timeout_secs(),
            qr_wait_secs: default_qr_wait_secs(),
            credential_purge_delay_ms: default_credential_purge_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

impl SessionConfig {
    pub fn qr_timeout(&self) -> Duration {
        Duration::from_secs(self.qr_timeout_secs)
    }

    pub fn qr_wait(&self) -> Duration {
        Duration::from_secs(self.qr_wait_secs)
    }

    pub fn credential_purge_delay(&self) -> Duration {
        Duration::from_millis(self.credential_purge_delay_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Delay before reconnect attempt `attempt` (1-based), doubling each time
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(multiplier))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Worker pool size; 0 picks max(2 × cores, 4)
    #[serde(default)]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 1000 }
fn default_backoff_max_ms() -> u64 { 60_000 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn worker_count(&self) -> usize {
        if self.concurrency > 0 {
            return self.concurrency;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cores * 2).max(4)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained sends per second per device
    pub per_second: u32,
    pub burst: u32,
    /// Upper bound on live per-device buckets
    pub max_buckets: usize,
    pub idle_eviction_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 15,
            burst: 15,
            max_buckets: 10_000,
            idle_eviction_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// WebSocket base URL of the device bridge
    pub url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 { 30 }

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3100".to_string(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Try to load from environment variable
        if let Ok(path) = std::env::var("WASEND_CONFIG") {
            return Self::load_from_path(&PathBuf::from(path));
        }

        let default_paths = vec![
            PathBuf::from("wasend-server.toml"),
            PathBuf::from("config/wasend-server.toml"),
            PathBuf::from("/etc/wasend/server.toml"),
        ];

        for path in default_paths {
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }

        tracing::warn!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
