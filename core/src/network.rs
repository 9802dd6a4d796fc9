//! Network layer for Callflow - call-log HTTP API and realtime WebSocket transport

use crate::config::{ClientConfig, TransportConfig};
use crate::error::{Error, Result};
use crate::models::*;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use reqwest::{Client, Response};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

// ============================================================================
// Call-log HTTP API
// ============================================================================

/// The REST resource holding the persisted record of each call.
#[async_trait]
pub trait CallLogApi: Send + Sync {
    /// `POST /calls/start`, once per outgoing call before any signaling.
    async fn start_call(&self, request: &StartCallRequest) -> Result<CallLogRecord>;

    /// `PATCH /calls/{id}/status` at each lifecycle milestone.
    async fn update_status(&self, call_id: &str, update: &StatusUpdate) -> Result<()>;
}

pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.server.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url(),
            token: Mutex::new(None),
        })
    }

    pub fn set_token(&self, token: &str) {
        *self.token.lock() = Some(token.to_string());
    }

    fn auth_header(&self) -> Option<String> {
        self.token
            .lock()
            .as_ref()
            .map(|t| format!("Bearer {}", t))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("{} cannot be a base URL", self.base_url)))?
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_header() {
            Some(auth) => req.header("Authorization", auth),
            None => req,
        }
    }

    pub async fn get_turn_credentials(&self) -> Result<TurnCredentials> {
        let req = self.client.get(self.endpoint(&["turn", "credentials"])?);
        let resp = ensure_success(self.authorized(req).send().await?, "turn credentials")?;
        let creds: TurnCredentials = resp.json().await?;
        Ok(creds)
    }
}

#[async_trait]
impl CallLogApi for ApiClient {
    async fn start_call(&self, request: &StartCallRequest) -> Result<CallLogRecord> {
        let req = self
            .client
            .post(self.endpoint(&["calls", "start"])?)
            .json(request);

        let resp = ensure_success(self.authorized(req).send().await?, "start call")?;
        let record: CallLogRecord = resp.json().await?;
        Ok(record)
    }

    async fn update_status(&self, call_id: &str, update: &StatusUpdate) -> Result<()> {
        let req = self
            .client
            .patch(self.endpoint(&["calls", call_id, "status"])?)
            .json(update);

        ensure_success(self.authorized(req).send().await?, "update call status")?;
        Ok(())
    }
}

fn ensure_success(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(Error::Persistence(format!("{} returned {}", what, status)))
    }
}

// ============================================================================
// Realtime transport
// ============================================================================

/// Everything the realtime connection delivers, tagged by kind.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    Connected,
    Disconnected,
    Signal(SignalingEnvelope),
    Notification(serde_json::Value),
}

/// A user-scoped realtime channel shared by calls and other features.
pub trait SignalingTransport: Send + Sync {
    /// Fire-and-forget, at-most-once.
    fn send(&self, envelope: SignalingEnvelope) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent>;
}

pub struct WebSocketClient {
    sender: mpsc::UnboundedSender<String>,
    events: broadcast::Sender<RealtimeEvent>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketClient {
    /// Start the connection supervisor. Returns immediately; watch
    /// `subscribe()` for `RealtimeEvent::Connected`.
    pub fn connect(config: &ClientConfig, token: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let (events, _) = broadcast::channel(config.transport.event_buffer.max(16));
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let supervisor = Supervisor {
            url: config.ws_url(),
            token: token.to_string(),
            settings: config.transport.clone(),
            outgoing: rx,
            events: events.clone(),
            connected: connected.clone(),
        };
        let task = tokio::spawn(supervisor.run(shutdown.clone()));

        Self {
            sender: tx,
            events,
            connected,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn disconnect(&self) {
        self.shutdown.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl SignalingTransport for WebSocketClient {
    fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::WebSocket(format!(
                "not connected, dropping {}",
                envelope.signal.kind()
            )));
        }

        let frame = json!({
            "type": "signal",
            "payload": envelope
        });

        self.sender
            .send(frame.to_string())
            .map_err(|e| Error::WebSocket(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

enum Exit {
    Closed,
    Stopped,
}

struct Supervisor {
    url: String,
    token: String,
    settings: TransportConfig,
    outgoing: mpsc::UnboundedReceiver<String>,
    events: broadcast::Sender<RealtimeEvent>,
    connected: Arc<AtomicBool>,
}

impl Supervisor {
    async fn run(mut self, shutdown: Arc<Notify>) {
        let mut backoff = self.settings.reconnect_initial_ms.max(1);

        loop {
            let result = tokio::select! {
                _ = shutdown.notified() => break,
                result = self.session() => result,
            };

            let was_connected = self.connected.swap(false, Ordering::SeqCst);
            if was_connected {
                let _ = self.events.send(RealtimeEvent::Disconnected);
                backoff = self.settings.reconnect_initial_ms.max(1);
            }

            match result {
                Ok(Exit::Stopped) => break,
                Ok(Exit::Closed) => log::info!("Realtime connection closed by server"),
                Err(e) => log::warn!("Realtime connection lost: {}", e),
            }

            let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
            let delay = Duration::from_millis(backoff + jitter);
            log::debug!("Reconnecting in {:?}", delay);

            tokio::select! {
                _ = shutdown.notified() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = (backoff * 2).min(self.settings.reconnect_max_ms.max(1));
        }

        self.connected.store(false, Ordering::SeqCst);
        log::info!("Realtime transport stopped");
    }

    async fn session(&mut self) -> Result<Exit> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let auth_msg = json!({
            "type": "authenticate",
            "payload": { "token": self.token }
        });
        write.send(WsMessage::Text(auth_msg.to_string())).await?;

        // Frames queued during the outage are stale by now.
        while self.outgoing.try_recv().is_ok() {}

        let period = Duration::from_secs(self.settings.ping_interval_secs.max(1));
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&text),
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(Exit::Closed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                },
                out = self.outgoing.recv() => match out {
                    Some(text) => write.send(WsMessage::Text(text)).await?,
                    None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return Ok(Exit::Stopped);
                    }
                },
                _ = ping.tick() => {
                    write.send(WsMessage::Text(json!({ "type": "ping" }).to_string())).await?;
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let data = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Unparseable realtime frame: {}", e);
                return;
            }
        };

        let event = match data["type"].as_str() {
            Some("authenticated") => {
                self.connected.store(true, Ordering::SeqCst);
                log::info!("Realtime connection authenticated");
                Some(RealtimeEvent::Connected)
            }
            Some("signal") => data
                .get("payload")
                .cloned()
                .and_then(|payload| match serde_json::from_value::<SignalingEnvelope>(payload) {
                    Ok(envelope) => Some(RealtimeEvent::Signal(envelope)),
                    Err(e) => {
                        log::warn!("Dropping malformed signal: {}", e);
                        None
                    }
                }),
            Some("notification") => data
                .get("payload")
                .cloned()
                .map(RealtimeEvent::Notification),
            Some("error") => {
                log::warn!(
                    "Server error {}: {}",
                    data["payload"]["code"].as_str().unwrap_or("UNKNOWN"),
                    data["payload"]["message"].as_str().unwrap_or_default()
                );
                None
            }
            Some("pong") => None,
            other => {
                log::debug!("Ignoring realtime frame {:?}", other);
                None
            }
        };

        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }
}
