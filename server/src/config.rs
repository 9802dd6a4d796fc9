//! Configuration management for Callflow Server

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub turn: TurnConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC key for bearer tokens. Rotating it signs everyone out.
    pub token_secret: String,
    pub token_ttl_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file, or `:memory:` for a throwaway database.
    pub database_path: String,
    pub cleanup_interval_minutes: u64,
    /// Ringing rows older than this are swept to `missed`.
    pub stale_ringing_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    pub enabled: bool,
    pub urls: Vec<String>,
    /// Shared secret with the TURN server (REST API credential scheme).
    pub secret: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_signal_size_kb: u64,
    pub max_call_history: i64,
}

impl Config {
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path).await?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            let content = toml::to_string_pretty(&config)?;
            fs::write(path, content).await?;
            tracing::info!("Created default config at {}", path);
            Ok(config)
        }
    }

    pub fn max_signal_bytes(&self) -> usize {
        (self.limits.max_signal_size_kb as usize) * 1024
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8443,
            },
            auth: AuthConfig {
                token_secret: "CHANGE_ME_TO_A_LONG_RANDOM_SECRET".to_string(),
                token_ttl_hours: 24 * 7,
            },
            storage: StorageConfig {
                database_path: "./data/callflow.db".to_string(),
                cleanup_interval_minutes: 5,
                stale_ringing_minutes: 2,
            },
            turn: TurnConfig {
                enabled: false,
                urls: vec![
                    "turn:turn.example.com:3478".to_string(),
                    "turns:turn.example.com:5349".to_string(),
                ],
                secret: "CHANGE_ME".to_string(),
                ttl_seconds: 86400,
            },
            limits: LimitsConfig {
                max_signal_size_kb: 64,
                max_call_history: 200,
            },
        }
    }
}
