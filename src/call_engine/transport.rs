//! Transport Session
//!
//! Kapselt genau eine Peer Connection samt ihrer lokalen Tracks. Die
//! eigentliche Verbindung liefert ein [`TransportFactory`]; in Produktion
//! ist das die WebRTC-Implementierung aus `webrtc_peer`.
//!
//! Nach `close()` schlägt jede weitere Operation mit
//! [`TransportError::Closed`] fehl.

use super::media::{LocalTrack, MediaHandle, MediaSource, TrackKind};
use super::session::CallRole;
use crate::signaling::{IceCandidate, SessionDescription, SessionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport session already closed")]
    Closed,

    #[error("Remote description has not been applied")]
    NoRemoteDescription,

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("WebRTC error: {0}")]
    Backend(String),
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Eingehender Media-Track des Peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Events einer Peer Connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Neuer lokaler ICE Candidate, sofort an den Peer weiterleiten
    LocalCandidate(IceCandidate),
    /// Remote Track für die Darstellung
    RemoteTrack(RemoteTrack),
    /// Verbindung steht
    Connected,
    /// Verbindung verloren oder Verhandlung gescheitert
    Failed(String),
}

/// Sendet Transport-Events, markiert mit der Session-ID, an den Coordinator
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<(SessionId, TransportEvent)>,
}

impl TransportEventSink {
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<(SessionId, TransportEvent)>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn emit(&self, event: TransportEvent) {
        if self.tx.send((self.session_id.clone(), event)).is_err() {
            tracing::debug!("Transport event for {} dropped, coordinator gone", self.session_id);
        }
    }
}

// ============================================================================
// PEER TRANSPORT
// ============================================================================

/// Eine einzelne Peer-to-Peer Verbindung
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError>;
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// Erstellt eine Peer Connection pro Call Session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        role: CallRole,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

// ============================================================================
// TRANSPORT SESSION
// ============================================================================

pub struct TransportSession {
    session_id: SessionId,
    role: CallRole,
    peer: Arc<dyn PeerTransport>,
    media_source: Arc<dyn MediaSource>,
    media: Mutex<Option<MediaHandle>>,
    attached: Mutex<Vec<LocalTrack>>,
    remote_applied: AtomicBool,
    closed: AtomicBool,
}

impl TransportSession {
    /// Erstellt die Peer Connection für `media`
    ///
    /// Schlägt das fehl, wird das Media-Handle sofort wieder freigegeben.
    pub async fn open(
        factory: &dyn TransportFactory,
        role: CallRole,
        media: MediaHandle,
        media_source: Arc<dyn MediaSource>,
        events: TransportEventSink,
    ) -> Result<Self, TransportError> {
        let session_id = events.session_id().clone();

        let peer = match factory.create(role, events).await {
            Ok(peer) => peer,
            Err(e) => {
                media_source.release(&media);
                return Err(e);
            }
        };

        tracing::debug!("Opened {:?} transport for session {}", role, session_id);

        Ok(Self {
            session_id,
            role,
            peer,
            media_source,
            media: Mutex::new(Some(media)),
            attached: Mutex::new(Vec::new()),
            remote_applied: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_applied.load(Ordering::SeqCst)
    }

    pub fn attached_tracks(&self) -> Vec<LocalTrack> {
        self.attached.lock().clone()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Hängt alle Tracks des Media-Handles an, die noch fehlen
    pub async fn attach_local_tracks(&self) -> Result<usize, TransportError> {
        self.ensure_open()?;

        let tracks = self
            .media
            .lock()
            .as_ref()
            .map(|m| m.tracks.clone())
            .ok_or(TransportError::Closed)?;

        let mut added = 0;
        for track in tracks {
            if self.attached.lock().iter().any(|t| t.id == track.id) {
                continue;
            }
            self.ensure_open()?;
            self.peer.add_track(&track).await?;
            self.attached.lock().push(track);
            added += 1;
        }

        Ok(added)
    }

    /// Erstellt ein Offer und setzt es als Local Description
    pub async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let offer = self.peer.create_offer().await?;
        self.ensure_open()?;
        self.peer.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Erstellt ein Answer und setzt es als Local Description
    pub async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if !self.has_remote_description() {
            return Err(TransportError::NoRemoteDescription);
        }
        let answer = self.peer.create_answer().await?;
        self.ensure_open()?;
        self.peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    pub async fn apply_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.peer.set_remote_description(desc).await?;
        self.remote_applied.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.has_remote_description() {
            return Err(TransportError::NoRemoteDescription);
        }
        self.peer.add_ice_candidate(candidate).await
    }

    /// Schließt die Verbindung und gibt die Medien frei
    ///
    /// Gibt `true` zurück, wenn dieser Aufruf tatsächlich geschlossen hat.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.attached.lock().clear();
        if let Some(media) = self.media.lock().take() {
            self.media_source.release(&media);
        }

        if let Err(e) = self.peer.close().await {
            tracing::warn!("Failed to close peer connection for {}: {}", self.session_id, e);
        }

        tracing::info!("Transport for session {} closed", self.session_id);
        true
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }

        tracing::warn!("Transport for session {} dropped without close", self.session_id);
        if let Some(media) = self.media.lock().take() {
            self.media_source.release(&media);
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let peer = Arc::clone(&self.peer);
            handle.spawn(async move {
                let _ = peer.close().await;
            });
        }
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("attached", &self.attached.lock().len())
            .field("remote_applied", &self.has_remote_description())
            .field("closed", &self.is_closed())
            .finish()
    }
}
