//! Data models for Callflow Server

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Call Log Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CallLog {
    pub id: i64,
    pub room_id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub call_type: String,
    pub status: String,
    pub duration: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl CallLog {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.receiver_id == user_id
    }

    pub fn status(&self) -> Option<CallLogStatus> {
        CallLogStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallLogStatus {
    Ringing,
    Connected,
    Ended,
    Declined,
    Missed,
}

impl CallLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallLogStatus::Ringing => "ringing",
            CallLogStatus::Connected => "connected",
            CallLogStatus::Ended => "ended",
            CallLogStatus::Declined => "declined",
            CallLogStatus::Missed => "missed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ringing" => Some(CallLogStatus::Ringing),
            "connected" => Some(CallLogStatus::Connected),
            "ended" => Some(CallLogStatus::Ended),
            "declined" => Some(CallLogStatus::Declined),
            "missed" => Some(CallLogStatus::Missed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallLogStatus::Ended | CallLogStatus::Declined | CallLogStatus::Missed
        )
    }

    /// Both participants report `connected`, so the repeat is accepted.
    pub fn can_become(&self, next: CallLogStatus) -> bool {
        use CallLogStatus::*;
        match self {
            Ringing => matches!(next, Connected | Ended | Declined | Missed),
            Connected => matches!(next, Connected | Ended),
            Ended | Declined | Missed => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallRequest {
    pub room_id: String,
    pub receiver_id: String,
    pub call_type: CallType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: CallLogStatus,
    #[serde(default)]
    pub duration: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListCallsQuery {
    pub limit: Option<i64>,
}

// ============================================================================
// WebSocket Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsClientMessage {
    #[serde(rename = "authenticate")]
    Authenticate { token: String },

    #[serde(rename = "signal")]
    Signal(SignalEnvelope),

    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsServerMessage {
    #[serde(rename = "authenticated")]
    Authenticated { user_id: String },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "signal")]
    Signal(SignalEnvelope),

    #[serde(rename = "notification")]
    Notification(Value),

    #[serde(rename = "pong")]
    Pong,
}

impl WsServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        WsServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Call Signaling Models
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    CallOffer,
    CallAnswer,
    IceCandidate,
    CallEnd,
    CallDecline,
}

/// A signaling message as the relay sees it: routing fields plus an opaque
/// body that is forwarded untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub room_id: String,
    pub call_id: String,
    pub to: String,
    /// Set by the relay to the authenticated user. Any client value is replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl SignalEnvelope {
    /// `from.id` as claimed by offers and answers.
    pub fn claimed_sender(&self) -> Option<&str> {
        self.body.get("from")?.get("id")?.as_str()
    }

    /// Offers and answers carry a `from` that must match the socket's user.
    pub fn sender_matches(&self, user_id: &str) -> bool {
        match self.kind {
            SignalKind::CallOffer | SignalKind::CallAnswer => {
                self.claimed_sender() == Some(user_id)
            }
            _ => true,
        }
    }
}

// ============================================================================
// API Response Models
// ============================================================================

#[derive(Debug, Serialize)]
pub struct TurnCredentialsResponse {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
    pub ttl: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub online_users: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        use CallLogStatus::*;
        assert!(Ringing.can_become(Connected));
        assert!(Ringing.can_become(Missed));
        assert!(Connected.can_become(Connected));
        assert!(Connected.can_become(Ended));
        assert!(!Connected.can_become(Declined));
        assert!(!Ringing.can_become(Ringing));
        for terminal in [Ended, Declined, Missed] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_become(Ended));
        }
    }

    #[test]
    fn test_signal_body_is_preserved() {
        let raw = json!({
            "type": "signal",
            "payload": {
                "type": "call_offer",
                "roomId": "room-1",
                "callId": "7",
                "to": "bob",
                "callType": "video",
                "offer": { "type": "offer", "sdp": "v=0" },
                "from": { "id": "alice", "name": "Alice" }
            }
        });

        let message: WsClientMessage = serde_json::from_value(raw.clone()).unwrap();
        let WsClientMessage::Signal(envelope) = message else {
            panic!("expected signal");
        };
        assert_eq!(envelope.kind, SignalKind::CallOffer);
        assert_eq!(envelope.to, "bob");
        assert!(envelope.sender_matches("alice"));
        assert!(!envelope.sender_matches("mallory"));

        let forwarded = serde_json::to_value(WsServerMessage::Signal(envelope)).unwrap();
        assert_eq!(forwarded["payload"], raw["payload"]);
    }

    #[test]
    fn test_candidates_need_no_sender() {
        let envelope: SignalEnvelope = serde_json::from_value(json!({
            "type": "ice_candidate",
            "roomId": "r",
            "callId": "c",
            "to": "bob",
            "candidate": { "candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0 }
        }))
        .unwrap();
        assert!(envelope.sender_matches("anyone"));
    }

    #[test]
    fn test_unknown_signal_kind_is_rejected() {
        let result = serde_json::from_value::<SignalEnvelope>(json!({
            "type": "call_transfer", "roomId": "r", "callId": "c", "to": "u"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_ping_has_no_payload() {
        let ping: WsClientMessage = serde_json::from_value(json!({ "type": "ping" })).unwrap();
        assert!(matches!(ping, WsClientMessage::Ping));
        assert_eq!(serde_json::to_value(WsServerMessage::Pong).unwrap(), json!({ "type": "pong" }));
    }
}
