//! Data models for Callflow calls

use serde::{Deserialize, Deserializer, Serialize};

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn has_video(self) -> bool {
        matches!(self, CallType::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Lifecycle of the live call. `Ended` only ever shows up in transition
/// notices; the live session goes straight back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Idle,
    Initiating,
    Ringing,
    Connecting,
    Connected,
    Ended,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self::Idle
    }
}

/// A call participant as shown in call UI.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

impl Participant {
    pub fn new(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            avatar_ref: None,
        }
    }
}

/// Read-only view of the live call for rendering.
///
/// `duration_seconds` counts while Connected and drops back to 0 with the rest
/// of the snapshot at teardown. The final value is carried by
/// [`CallNotice::Ended`](crate::call::CallNotice::Ended).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub call_id: Option<String>,
    pub room_id: Option<String>,
    pub status: CallStatus,
    pub call_type: Option<CallType>,
    pub direction: Option<CallDirection>,
    pub counterpart: Option<Participant>,
    pub duration_seconds: u64,
    pub is_muted: bool,
    pub is_video_enabled: bool,
}

// ============================================================================
// Signaling
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP blob in the browser `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    CallOffer {
        #[serde(rename = "callType")]
        call_type: CallType,
        offer: SessionDescription,
        from: Participant,
    },
    CallAnswer {
        answer: SessionDescription,
        from: Participant,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    CallEnd,
    CallDecline,
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::CallOffer { .. } => "call_offer",
            Signal::CallAnswer { .. } => "call_answer",
            Signal::IceCandidate { .. } => "ice_candidate",
            Signal::CallEnd => "call_end",
            Signal::CallDecline => "call_decline",
        }
    }
}

/// One signaling message routed to `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    pub room_id: String,
    pub call_id: String,
    pub to: String,
    /// Authenticated sender, stamped by the relay. Outbound envelopes leave it
    /// empty; whatever a client puts here is overwritten server-side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(flatten)]
    pub signal: Signal,
}

impl SignalingEnvelope {
    pub fn new(room_id: &str, call_id: &str, to: &str, signal: Signal) -> Self {
        Self {
            room_id: room_id.to_string(),
            call_id: call_id.to_string(),
            to: to.to_string(),
            sender: None,
            signal,
        }
    }

    /// Whether this envelope may have come from `user_id`.
    ///
    /// The relay stamp wins. Offers and answers also carry `from`, which has
    /// to agree with it. Envelopes with neither are taken on trust.
    pub fn is_from(&self, user_id: &str) -> bool {
        if matches!(self.sender.as_deref(), Some(sender) if sender != user_id) {
            return false;
        }
        match &self.signal {
            Signal::CallOffer { from, .. } | Signal::CallAnswer { from, .. } => from.id == user_id,
            _ => true,
        }
    }
}

// ============================================================================
// Call log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallLogStatus {
    Ringing,
    Connected,
    Ended,
    Declined,
    Missed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallRequest {
    pub room_id: String,
    pub receiver_id: String,
    pub call_type: CallType,
}

/// The parts of the persisted call row the client cares about.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLogRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub status: Option<CallLogStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub status: CallLogStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

// Call-log backends hand out either numeric or string ids.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

// ============================================================================
// TURN
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_envelope_uses_browser_wire_shape() {
        let envelope = SignalingEnvelope::new(
            "room-7",
            "42",
            "bob",
            Signal::CallOffer {
                call_type: CallType::Video,
                offer: SessionDescription::offer("v=0"),
                from: Participant::new("alice", "Alice"),
            },
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "call_offer",
                "roomId": "room-7",
                "callId": "42",
                "to": "bob",
                "callType": "video",
                "offer": { "type": "offer", "sdp": "v=0" },
                "from": { "id": "alice", "displayName": "Alice" }
            })
        );
    }

    #[test]
    fn bare_end_and_decline_parse() {
        let end: SignalingEnvelope = serde_json::from_value(json!({
            "type": "call_end", "roomId": "r", "callId": "c", "to": "u"
        }))
        .unwrap();
        assert_eq!(end.signal, Signal::CallEnd);

        let decline: SignalingEnvelope = serde_json::from_value(json!({
            "type": "call_decline", "roomId": "r", "callId": "c", "to": "u"
        }))
        .unwrap();
        assert_eq!(decline.signal.kind(), "call_decline");
    }

    #[test]
    fn relay_stamp_decides_who_sent_it() {
        let mut end: SignalingEnvelope = serde_json::from_value(json!({
            "type": "call_end", "roomId": "r", "callId": "c", "to": "u", "sender": "bob"
        }))
        .unwrap();
        assert_eq!(end.sender.as_deref(), Some("bob"));
        assert!(end.is_from("bob"));
        assert!(!end.is_from("mallory"));

        end.sender = None;
        assert!(end.is_from("mallory"));

        let mut answer = SignalingEnvelope::new(
            "r",
            "c",
            "u",
            Signal::CallAnswer {
                answer: SessionDescription::answer("v=0"),
                from: Participant::new("mallory", "Mallory"),
            },
        );
        assert!(!answer.is_from("bob"));
        answer.sender = Some("mallory".to_string());
        assert!(answer.is_from("mallory"));
        answer.signal = Signal::CallAnswer {
            answer: SessionDescription::answer("v=0"),
            from: Participant::new("bob", "Bob"),
        };
        assert!(!answer.is_from("bob"));
    }

    #[test]
    fn candidate_keeps_mline_index_spelling() {
        let envelope: SignalingEnvelope = serde_json::from_value(json!({
            "type": "ice_candidate",
            "roomId": "r",
            "callId": "c",
            "to": "u",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        }))
        .unwrap();

        match envelope.signal {
            Signal::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let result = serde_json::from_value::<SignalingEnvelope>(json!({
            "type": "call_transfer", "roomId": "r", "callId": "c", "to": "u"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn call_log_id_accepts_numbers() {
        let record: CallLogRecord =
            serde_json::from_value(json!({ "id": 981, "status": "ringing" })).unwrap();
        assert_eq!(record.id, "981");
        assert_eq!(record.status, Some(CallLogStatus::Ringing));

        let record: CallLogRecord = serde_json::from_value(json!({ "id": "c-1" })).unwrap();
        assert_eq!(record.id, "c-1");
    }

    #[test]
    fn status_update_omits_missing_duration() {
        let update = StatusUpdate {
            status: CallLogStatus::Declined,
            duration: None,
        };
        assert_eq!(serde_json::to_value(&update).unwrap(), json!({ "status": "declined" }));
    }
}
