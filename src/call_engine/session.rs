//! Call Session - ein einzelner Verhandlungsversuch
//!
//! Zustandsautomat:
//! - Anrufer: `Idle -> Offering -> Active -> Terminated`
//! - Angerufener: `Idle -> Ringing -> Active -> Terminated`
//! - Ablehnen: `Ringing -> Terminated`
//! - Jeder Zustand kann nach `Terminated` wechseln, `Terminated` ist endgültig.

use super::media::MediaKind;
use crate::signaling::{IceCandidate, SessionDescription, SessionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;

// ============================================================================
// CALL STATE
// ============================================================================

/// Status eines Anrufversuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Slot reserviert, Medien werden angefordert
    Idle,
    /// Offer gesendet, warte auf Answer
    Offering,
    /// Eingehender Anruf wartet auf Antwort
    Ringing,
    /// Offer/Answer abgeschlossen
    Active,
    /// Anruf beendet
    Terminated,
}

impl CallState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, CallState::Terminated)
    }

    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;

        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Idle, Offering) | (Idle, Ringing) | (Offering, Active) | (Ringing, Active) => true,
            _ => false,
        }
    }
}

/// Rolle in der Verhandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid call state transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: CallState,
    pub to: CallState,
}

// ============================================================================
// CALL SESSION
// ============================================================================

#[derive(Debug, Clone)]
pub struct CallSession {
    pub session_id: SessionId,
    pub role: CallRole,
    pub media_kind: MediaKind,
    state: CallState,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub remote_description_applied: bool,
    /// Lokale Candidates, die noch vor dem Offer/Answer entstanden sind
    pub pending_local_candidates: Vec<IceCandidate>,
    /// Entfernte Candidates, die vor der Remote Description ankamen
    pub pending_remote_candidates: VecDeque<IceCandidate>,
    pub remote_participant: Option<String>,
    pub created_at: DateTime<Utc>,
    next_local_seq: u64,
    last_remote_seq: Option<u64>,
}

impl CallSession {
    /// Neuer ausgehender Anruf im Zustand `Idle`
    pub fn outgoing(media_kind: MediaKind) -> Self {
        Self::new(SessionId::generate(), CallRole::Caller, media_kind)
    }

    /// Neuer eingehender Anruf im Zustand `Ringing`
    ///
    /// Das Offer wird nur gespeichert, angewendet wird es erst beim Annehmen.
    pub fn incoming(
        session_id: SessionId,
        media_kind: MediaKind,
        from_participant: String,
        offer: SessionDescription,
        seq: u64,
    ) -> Self {
        let mut session = Self::new(session_id, CallRole::Callee, media_kind);
        session.state = CallState::Ringing;
        session.remote_description = Some(offer);
        session.remote_participant = Some(from_participant);
        session.last_remote_seq = Some(seq);
        session
    }

    fn new(session_id: SessionId, role: CallRole, media_kind: MediaKind) -> Self {
        Self {
            session_id,
            role,
            media_kind,
            state: CallState::Idle,
            local_description: None,
            remote_description: None,
            remote_description_applied: false,
            pending_local_candidates: Vec::new(),
            pending_remote_candidates: VecDeque::new(),
            remote_participant: None,
            created_at: Utc::now(),
            next_local_seq: 1,
            last_remote_seq: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Wechselt den Zustand und gibt den vorherigen zurück
    pub fn transition(&mut self, next: CallState) -> Result<CallState, InvalidTransition> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.state = next;
        Ok(from)
    }

    /// Offer bzw. Answer wurde bereits an den Peer gesendet
    pub fn local_description_sent(&self) -> bool {
        matches!(self.state, CallState::Offering | CallState::Active)
    }

    /// Nächste ausgehende Sequenznummer
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_local_seq;
        self.next_local_seq += 1;
        seq
    }

    /// Prüft eine eingehende Sequenznummer, `false` bei Duplikaten
    pub fn accept_remote_seq(&mut self, seq: u64) -> bool {
        match self.last_remote_seq {
            Some(last) if seq <= last => false,
            _ => {
                self.last_remote_seq = Some(seq);
                true
            }
        }
    }

    pub fn take_pending_remote_candidates(&mut self) -> Vec<IceCandidate> {
        self.pending_remote_candidates.drain(..).collect()
    }

    pub fn take_pending_local_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_local_candidates)
    }
}
