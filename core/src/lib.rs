//! Callflow Core Library
//!
//! Client-side call engine for one-to-one audio and video calls.
//! Provides: the call state machine, signaling transport, peer sessions,
//! media acquisition, sound cues and the call-log client.

pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod models;
pub mod network;
pub mod peer;
pub mod sound;

use std::sync::Arc;

pub use call::{CallCommand, CallDeps, CallEvent, CallHandle, CallMachine, CallNotice, EndReason};
pub use config::*;
pub use error::*;
pub use models::*;
pub use network::*;

use media::DeviceMediaAcquirer;
use peer::WebRtcConnector;

/// Main client instance: one per signed-in user.
pub struct CallClient {
    api: Arc<ApiClient>,
    transport: Arc<WebSocketClient>,
    calls: CallHandle,
}

impl CallClient {
    /// Wire the real collaborators together and start the call engine.
    /// `token` is the bearer token for both the REST API and the realtime
    /// connection.
    pub async fn connect(mut config: ClientConfig, profile: Participant, token: &str) -> Result<Self> {
        let api = Arc::new(ApiClient::new(&config)?);
        api.set_token(token);

        if config.call.fetch_turn_credentials {
            match api.get_turn_credentials().await {
                Ok(creds) => config.call.ice_servers.push(creds.into()),
                Err(e) => log::warn!("TURN credentials unavailable, using configured ICE servers: {}", e),
            }
        }

        let transport = Arc::new(WebSocketClient::connect(&config, token));

        let deps = CallDeps {
            transport: transport.clone(),
            peers: Arc::new(WebRtcConnector::new()?),
            media: Arc::new(DeviceMediaAcquirer::new(config.media.clone())),
            sounds: sound::cue_player(&config.sounds),
            call_log: api.clone(),
        };

        log::info!("Call engine ready for {}", profile.id);
        let calls = call::spawn(profile, config.call, deps);

        Ok(Self {
            api,
            transport,
            calls,
        })
    }

    pub fn calls(&self) -> &CallHandle {
        &self.calls
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn transport(&self) -> &WebSocketClient {
        &self.transport
    }

    /// Hang up, stop the engine and close the realtime connection.
    pub async fn shutdown(&self) {
        self.calls.shutdown().await;
        self.transport.disconnect().await;
    }
}
