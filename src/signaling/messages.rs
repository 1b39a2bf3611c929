//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht über den Relay trägt die `sessionId` des Anrufversuchs,
//! den Absender und eine fortlaufende Sequenznummer. Der Relay darf
//! Nachrichten doppelt zustellen, der Coordinator verwirft Duplikate
//! anhand von `seq`.

use crate::call_engine::MediaKind;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Eindeutige ID eines Anrufversuchs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Erzeugt eine neue, zufällige Session-ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// NEGOTIATION PAYLOADS
// ============================================================================

/// Typ einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP Offer oder Answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate, wie er über den Relay übertragen wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// SIGNALING MESSAGES
// ============================================================================

/// Inhalt einer Signaling-Nachricht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingPayload {
    Offer {
        sdp: String,
        #[serde(rename = "mediaKind")]
        media_kind: MediaKind,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: IceCandidate,
    },
    Hangup,
    Decline {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl SignalingPayload {
    /// Event-Name auf dem Relay
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Hangup => "hangup",
            Self::Decline { .. } => "decline",
        }
    }
}

/// Eine Nachricht zwischen den beiden Teilnehmern einer Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    #[serde(rename = "fromParticipant")]
    pub from_participant: String,
    pub seq: u64,
    #[serde(flatten)]
    pub payload: SignalingPayload,
}

impl SignalingMessage {
    pub fn new(
        session_id: SessionId,
        from_participant: String,
        seq: u64,
        payload: SignalingPayload,
    ) -> Self {
        Self {
            session_id,
            from_participant,
            seq,
            payload,
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.payload.event_name()
    }
}

// ============================================================================
// CLIENT → SERVER FRAMES
// ============================================================================

/// Anmeldung am Relay direkt nach dem Verbindungsaufbau
#[derive(Debug, Clone, Serialize)]
pub struct JoinFrame {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "participantId")]
    pub participant_id: String,
}

impl JoinFrame {
    pub fn new(participant_id: String) -> Self {
        Self {
            msg_type: "join",
            participant_id,
        }
    }
}

/// Heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatFrame {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "participantId")]
    pub participant_id: String,
    pub timestamp: i64,
}

impl HeartbeatFrame {
    pub fn new(participant_id: String, timestamp: i64) -> Self {
        Self {
            msg_type: "heartbeat",
            participant_id,
            timestamp,
        }
    }
}

// ============================================================================
// SERVER → CLIENT FRAMES
// ============================================================================

/// Nachrichten des Relays selbst (keine Peer-Nachrichten)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerNotice {
    /// Heartbeat Antwort
    Pong {
        #[serde(default)]
        timestamp: i64,
    },

    /// Fehler
    Error { code: i32, message: String },
}
