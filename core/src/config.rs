//! Client configuration for Callflow

use crate::error::Result;
use crate::models::TurnCredentials;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub call: CallConfig,
    pub transport: TransportConfig,
    pub media: MediaConfig,
    pub sounds: SoundConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    /// Outgoing calls with no answer after this long are marked missed.
    pub ringing_timeout_secs: u64,
    pub tick_interval_ms: u64,
    /// Append server-issued TURN credentials to `ice_servers` on connect.
    pub fetch_turn_credentials: bool,
    pub max_pending_candidates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub ping_interval_secs: u64,
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub require_microphone: bool,
    pub camera_device: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundConfig {
    pub enabled: bool,
    pub volume: f32,
    pub ringtone: Option<PathBuf>,
    pub connect: Option<PathBuf>,
    pub end: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9443,
            use_tls: true,
            request_timeout_secs: 15,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            ringing_timeout_secs: 60,
            tick_interval_ms: 1000,
            fetch_turn_credentials: false,
            max_pending_candidates: 64,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            ping_interval_secs: 25,
            event_buffer: 256,
        }
    }
}

impl Default for SoundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volume: 0.8,
            ringtone: None,
            connect: None,
            end: None,
        }
    }
}

impl CallConfig {
    pub fn ringing_timeout(&self) -> Duration {
        Duration::from_secs(self.ringing_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

impl From<TurnCredentials> for IceServer {
    fn from(creds: TurnCredentials) -> Self {
        Self {
            urls: creds.urls,
            username: Some(creds.username),
            credential: Some(creds.credential),
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server: ServerConfig {
                host: host.to_string(),
                port,
                use_tls,
                ..ServerConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let config_path = data_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.server.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server.host, self.server.port)
    }

    pub fn api_url(&self) -> String {
        format!("{}/api/v1", self.http_url())
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.server.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.server.host, self.server.port)
    }
}
