//! Call Coordinator
//!
//! Verbindet eingehende Relay-Nachrichten, lokale Benutzeraktionen und
//! Transport-Events zu genau einer aktiven Call Session.
//!
//! Locking:
//! - `registry` (parking_lot) schützt den Session-Slot und wird nie über ein
//!   `.await` gehalten.
//! - `negotiation` serialisiert alle Änderungen an der Peer Connection
//!   (Descriptions, Candidates).
//! - `outbound` hält Sequenznummer-Vergabe und Versand zusammen, damit der
//!   Peer Nachrichten in Sequenzreihenfolge erhält.
//!
//! Reihenfolge bei Bedarf: `negotiation` vor `outbound`.

use super::media::{MediaError, MediaHandle, MediaKind, MediaSource};
use super::session::{CallRole, CallSession, CallState};
use super::transport::{
    RemoteTrack, TransportError, TransportEvent, TransportEventSink, TransportFactory,
    TransportSession,
};
use crate::config::CallConfig;
use crate::signaling::{
    IceCandidate, RelayChannel, RelayError, RelayEvent, SessionDescription, SessionId,
    SignalingMessage, SignalingPayload,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Media unavailable: {0}")]
    MediaUnavailable(#[from] MediaError),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No such session: {0}")]
    NoSuchSession(SessionId),

    #[error("Session {session_id} is {state:?}")]
    WrongState {
        session_id: SessionId,
        state: CallState,
    },

    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("Channel delivery failed: {0}")]
    ChannelDeliveryFailure(#[from] RelayError),

    #[error("Session {0} was stopped")]
    Cancelled(SessionId),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Grund für das Ende einer Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Lokal aufgelegt
    LocalHangup,
    /// Lokal abgelehnt
    Declined,
    RemoteHangup,
    RemoteDeclined(Option<String>),
    MediaUnavailable(MediaError),
    NegotiationFailure(String),
    TransportFailure(String),
    DeliveryFailure(String),
    /// Coordinator wurde beendet
    Shutdown,
}

/// Events für die Darstellung
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged {
        session_id: SessionId,
        state: CallState,
    },
    IncomingCall {
        session_id: SessionId,
        from_participant: String,
        media_kind: MediaKind,
    },
    RemoteTrack {
        session_id: SessionId,
        track: RemoteTrack,
    },
    Ended {
        session_id: SessionId,
        reason: EndReason,
    },
    /// Relay-Probleme, nie fatal für die Session
    RelayError(String),
}

// ============================================================================
// SESSION REGISTRY
// ============================================================================

struct Slot {
    call: CallSession,
    transport: Option<Arc<TransportSession>>,
    /// Eine lokale Operation (start/accept) läuft gerade
    busy: bool,
    /// Teardown hat begonnen
    closing: bool,
}

impl Slot {
    fn new(call: CallSession, busy: bool) -> Self {
        Self {
            call,
            transport: None,
            busy,
            closing: false,
        }
    }
}

struct Registry {
    current: Option<Slot>,
    terminated: VecDeque<SessionId>,
    history_limit: usize,
}

impl Registry {
    fn live_mut(&mut self, session_id: &SessionId) -> Option<&mut Slot> {
        self.current
            .as_mut()
            .filter(|slot| slot.call.session_id == *session_id && !slot.closing)
    }

    fn state_of(&self, session_id: &SessionId) -> Option<CallState> {
        match &self.current {
            Some(slot) if slot.call.session_id == *session_id => Some(slot.call.state()),
            _ if self.terminated.contains(session_id) => Some(CallState::Terminated),
            _ => None,
        }
    }

    fn remember_terminated(&mut self, session_id: SessionId) {
        if self.history_limit == 0 {
            return;
        }
        self.terminated.push_back(session_id);
        while self.terminated.len() > self.history_limit {
            self.terminated.pop_front();
        }
    }
}

/// Aufräumarbeit einer Session, außerhalb des Registry-Locks ausgeführt
struct Teardown {
    session_id: SessionId,
    transport: Option<Arc<TransportSession>>,
    notify: Option<SignalingMessage>,
    reason: EndReason,
}

enum CandidateRoute {
    Apply(Arc<TransportSession>, IceCandidate),
    Buffered(usize),
    Overflow,
}

type TransportEventReceiver = mpsc::UnboundedReceiver<(SessionId, TransportEvent)>;

// ============================================================================
// CALL COORDINATOR
// ============================================================================

pub struct CallCoordinator {
    participant_id: String,
    max_pending_candidates: usize,
    relay: Arc<dyn RelayChannel>,
    media: Arc<dyn MediaSource>,
    transports: Arc<dyn TransportFactory>,
    registry: Mutex<Registry>,
    negotiation: AsyncMutex<()>,
    outbound: AsyncMutex<()>,
    event_tx: broadcast::Sender<CallEvent>,
    transport_tx: mpsc::UnboundedSender<(SessionId, TransportEvent)>,
    transport_rx: Mutex<Option<TransportEventReceiver>>,
}

impl CallCoordinator {
    pub fn new(
        config: &CallConfig,
        relay: Arc<dyn RelayChannel>,
        media: Arc<dyn MediaSource>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        Self {
            participant_id: config.participant_id.clone(),
            max_pending_candidates: config.max_pending_candidates,
            relay,
            media,
            transports,
            registry: Mutex::new(Registry {
                current: None,
                terminated: VecDeque::new(),
                history_limit: config.terminated_history,
            }),
            negotiation: AsyncMutex::new(()),
            outbound: AsyncMutex::new(()),
            event_tx,
            transport_tx,
            transport_rx: Mutex::new(Some(transport_rx)),
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Kopie der aktuell lebenden Session
    pub fn current_session(&self) -> Option<CallSession> {
        self.registry
            .lock()
            .current
            .as_ref()
            .filter(|slot| !slot.closing)
            .map(|slot| slot.call.clone())
    }

    /// Status einer Session, auch kürzlich beendeter
    pub fn session_state(&self, session_id: &SessionId) -> Option<CallState> {
        self.registry.lock().state_of(session_id)
    }

    // ========================================================================
    // LOCAL ACTIONS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    ///
    /// Der Slot wird sofort im Zustand `Idle` reserviert; die Session-ID
    /// erscheint im ersten `StateChanged`-Event und kann so an
    /// [`stop_call`](Self::stop_call) übergeben werden, bevor dieser Aufruf
    /// zurückkehrt.
    pub async fn start_call(&self, media_kind: MediaKind) -> Result<CallSession, CallError> {
        let session_id = {
            let mut registry = self.registry.lock();
            if registry.current.is_some() {
                tracing::warn!("Rejecting outgoing call: already in a call");
                return Err(CallError::AlreadyInCall);
            }
            let call = CallSession::outgoing(media_kind);
            let session_id = call.session_id.clone();
            registry.current = Some(Slot::new(call, true));
            session_id
        };

        tracing::info!("Starting {:?} call {}", media_kind, session_id);
        self.emit_state(&session_id, CallState::Idle);

        let media = match self.media.acquire(media_kind).await {
            Ok(media) => media,
            Err(e) => {
                if !self.is_live(&session_id) {
                    return Err(CallError::Cancelled(session_id));
                }
                tracing::error!("Media acquisition failed for {}: {}", session_id, e);
                self.terminate(&session_id, EndReason::MediaUnavailable(e.clone()), None)
                    .await;
                return Err(CallError::MediaUnavailable(e));
            }
        };

        if !self.is_live(&session_id) {
            tracing::info!("Call {} stopped during media acquisition", session_id);
            self.media.release(&media);
            return Err(CallError::Cancelled(session_id));
        }

        let transport = self
            .open_transport(&session_id, CallRole::Caller, media, None)
            .await?;

        let negotiation = self.negotiation.lock().await;

        if let Err(e) = transport.attach_local_tracks().await {
            return Err(self.fail_negotiation(&session_id, e, None).await);
        }
        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail_negotiation(&session_id, e, None).await),
        };

        let outbound = self.outbound.lock().await;
        let prepared = self.with_live(&session_id, |slot| {
            if let Err(e) = slot.call.transition(CallState::Offering) {
                return Err(CallError::WrongState {
                    session_id: session_id.clone(),
                    state: e.from,
                });
            }
            slot.call.local_description = Some(offer.clone());
            slot.busy = false;

            let message = self.outbound_message(
                &mut slot.call,
                SignalingPayload::Offer {
                    sdp: offer.sdp.clone(),
                    media_kind,
                },
            );
            let candidates = self.drain_local_candidates(&mut slot.call);
            Ok((message, candidates, slot.call.clone()))
        });
        drop(negotiation);

        let (message, candidates, snapshot) = match prepared {
            Some(Ok(prepared)) => prepared,
            Some(Err(e)) => {
                drop(outbound);
                self.terminate(&session_id, EndReason::NegotiationFailure(e.to_string()), None)
                    .await;
                return Err(e);
            }
            None => return Err(CallError::Cancelled(session_id)),
        };
        self.emit_state(&session_id, CallState::Offering);

        if let Err(e) = self.relay.send(message).await {
            drop(outbound);
            tracing::error!("Failed to deliver offer for {}: {}", session_id, e);
            self.terminate(&session_id, EndReason::DeliveryFailure(e.to_string()), None)
                .await;
            return Err(CallError::ChannelDeliveryFailure(e));
        }
        self.send_all(candidates).await;
        drop(outbound);

        tracing::info!("Offer sent for call {}", session_id);
        Ok(snapshot)
    }

    /// Nimmt einen eingehenden Anruf an
    pub async fn accept_call(&self, session_id: &SessionId) -> Result<(), CallError> {
        let media_kind = {
            let mut registry = self.registry.lock();
            let state = registry
                .state_of(session_id)
                .ok_or_else(|| CallError::NoSuchSession(session_id.clone()))?;
            match registry.live_mut(session_id) {
                Some(slot) if state == CallState::Ringing && !slot.busy => {
                    slot.busy = true;
                    slot.call.media_kind
                }
                _ => {
                    return Err(CallError::WrongState {
                        session_id: session_id.clone(),
                        state,
                    })
                }
            }
        };

        tracing::info!("Accepting call {}", session_id);

        let media = match self.media.acquire(media_kind).await {
            Ok(media) => media,
            Err(e) => {
                // Bleibt Ringing, der Benutzer kann erneut annehmen oder ablehnen
                if self.with_live(session_id, |slot| slot.busy = false).is_none() {
                    return Err(CallError::Cancelled(session_id.clone()));
                }
                tracing::error!("Media acquisition failed for {}: {}", session_id, e);
                return Err(CallError::MediaUnavailable(e));
            }
        };

        if !self.is_live(session_id) {
            self.media.release(&media);
            return Err(CallError::Cancelled(session_id.clone()));
        }

        let hangup = Some(SignalingPayload::Hangup);
        let transport = self
            .open_transport(session_id, CallRole::Callee, media, hangup.clone())
            .await?;

        let negotiation = self.negotiation.lock().await;

        let offer = self
            .with_live(session_id, |slot| slot.call.remote_description.clone())
            .flatten();
        let Some(offer) = offer else {
            return Err(self
                .fail_negotiation(session_id, TransportError::NoRemoteDescription, hangup)
                .await);
        };

        if let Err(e) = transport.apply_remote_description(offer).await {
            return Err(self.fail_negotiation(session_id, e, hangup).await);
        }
        if let Err(e) = self.replay_remote_candidates(session_id, &transport).await {
            return Err(self.fail_negotiation(session_id, e, hangup).await);
        }
        if let Err(e) = transport.attach_local_tracks().await {
            return Err(self.fail_negotiation(session_id, e, hangup).await);
        }
        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail_negotiation(session_id, e, hangup).await),
        };

        // Active erst nach erfolgreichem Versand des Answers
        let outbound = self.outbound.lock().await;
        let message = self.with_live(session_id, |slot| {
            slot.call.local_description = Some(answer.clone());
            self.outbound_message(
                &mut slot.call,
                SignalingPayload::Answer {
                    sdp: answer.sdp.clone(),
                },
            )
        });
        let Some(message) = message else {
            return Err(CallError::Cancelled(session_id.clone()));
        };

        if let Err(e) = self.relay.send(message).await {
            drop(outbound);
            drop(negotiation);
            tracing::error!("Failed to deliver answer for {}: {}", session_id, e);
            self.terminate(
                session_id,
                EndReason::DeliveryFailure(e.to_string()),
                Some(SignalingPayload::Hangup),
            )
            .await;
            return Err(CallError::ChannelDeliveryFailure(e));
        }

        let committed = self.with_live(session_id, |slot| {
            if let Err(e) = slot.call.transition(CallState::Active) {
                return Err(CallError::WrongState {
                    session_id: session_id.clone(),
                    state: e.from,
                });
            }
            slot.busy = false;
            Ok(self.drain_local_candidates(&mut slot.call))
        });
        drop(negotiation);

        let candidates = match committed {
            Some(Ok(candidates)) => candidates,
            Some(Err(e)) => {
                drop(outbound);
                self.terminate(
                    session_id,
                    EndReason::NegotiationFailure(e.to_string()),
                    Some(SignalingPayload::Hangup),
                )
                .await;
                return Err(e);
            }
            None => return Err(CallError::Cancelled(session_id.clone())),
        };
        self.emit_state(session_id, CallState::Active);

        self.send_all(candidates).await;
        drop(outbound);

        tracing::info!("Answer sent for call {}", session_id);
        Ok(())
    }

    /// Lehnt einen klingelnden Anruf ab
    pub async fn decline_call(&self, session_id: &SessionId) -> Result<(), CallError> {
        let teardown = {
            let mut registry = self.registry.lock();
            let state = registry
                .state_of(session_id)
                .ok_or_else(|| CallError::NoSuchSession(session_id.clone()))?;
            let ringing = registry
                .live_mut(session_id)
                .is_some_and(|slot| state == CallState::Ringing && !slot.busy);
            if !ringing {
                return Err(CallError::WrongState {
                    session_id: session_id.clone(),
                    state,
                });
            }
            self.begin_teardown(
                &mut registry,
                session_id,
                EndReason::Declined,
                Some(SignalingPayload::Decline { reason: None }),
            )
        };

        tracing::info!("Declining call {}", session_id);
        if let Some(teardown) = teardown {
            self.finish_teardown(teardown).await;
        }
        Ok(())
    }

    /// Beendet eine Session. Mehrfache Aufrufe sind wirkungslos.
    pub async fn stop_call(&self, session_id: &SessionId) {
        if !self
            .terminate(session_id, EndReason::LocalHangup, Some(SignalingPayload::Hangup))
            .await
        {
            tracing::debug!("stop_call: session {} is not live", session_id);
        }
    }

    /// Beendet die aktuelle Session, falls vorhanden
    pub async fn shutdown(&self) {
        let current = self
            .registry
            .lock()
            .current
            .as_ref()
            .map(|slot| slot.call.session_id.clone());

        if let Some(session_id) = current {
            tracing::info!("Shutting down, ending call {}", session_id);
            self.terminate(&session_id, EndReason::Shutdown, Some(SignalingPayload::Hangup))
                .await;
        }
    }

    // ========================================================================
    // REMOTE MESSAGES
    // ========================================================================

    pub async fn on_offer_received(&self, message: SignalingMessage) {
        let SignalingPayload::Offer { sdp, media_kind } = message.payload else {
            return;
        };
        let session_id = message.session_id;

        let created = {
            let mut registry = self.registry.lock();
            if registry.terminated.contains(&session_id) {
                tracing::debug!("Ignoring offer for terminated session {}", session_id);
                false
            } else if let Some(slot) = &registry.current {
                if slot.call.session_id == session_id {
                    tracing::debug!("Ignoring repeated offer for {}", session_id);
                } else {
                    tracing::warn!(
                        "Ignoring offer {} from {}: call {} is in progress",
                        session_id,
                        message.from_participant,
                        slot.call.session_id
                    );
                }
                false
            } else {
                registry.current = Some(Slot::new(
                    CallSession::incoming(
                        session_id.clone(),
                        media_kind,
                        message.from_participant.clone(),
                        SessionDescription::offer(sdp),
                        message.seq,
                    ),
                    false,
                ));
                true
            }
        };

        if created {
            tracing::info!(
                "Incoming {:?} call {} from {}",
                media_kind,
                session_id,
                message.from_participant
            );
            self.emit_state(&session_id, CallState::Ringing);
            self.emit(CallEvent::IncomingCall {
                session_id,
                from_participant: message.from_participant,
                media_kind,
            });
        }
    }

    pub async fn on_answer_received(&self, message: SignalingMessage) {
        let SignalingPayload::Answer { sdp } = message.payload else {
            return;
        };
        let session_id = message.session_id;
        let answer = SessionDescription::answer(sdp);

        let negotiation = self.negotiation.lock().await;

        let transport = self
            .with_live(&session_id, |slot| {
                let expected = slot.call.role == CallRole::Caller
                    && slot.call.state() == CallState::Offering
                    && !slot.call.remote_description_applied;
                if !expected {
                    return None;
                }
                slot.call.remote_description = Some(answer.clone());
                slot.transport.clone()
            })
            .flatten();

        let Some(transport) = transport else {
            tracing::warn!("Ignoring unexpected answer for session {}", session_id);
            return;
        };

        let hangup = Some(SignalingPayload::Hangup);
        if let Err(e) = transport.apply_remote_description(answer).await {
            self.fail_negotiation(&session_id, e, hangup).await;
            return;
        }
        if let Err(e) = self.replay_remote_candidates(&session_id, &transport).await {
            self.fail_negotiation(&session_id, e, hangup).await;
            return;
        }

        let activated = self
            .with_live(&session_id, |slot| {
                slot.call.transition(CallState::Active).is_ok()
            })
            .unwrap_or(false);
        drop(negotiation);

        if activated {
            tracing::info!("Call {} answered", session_id);
            self.emit_state(&session_id, CallState::Active);
        }
    }

    pub async fn on_candidate_received(&self, message: SignalingMessage) {
        let SignalingPayload::Candidate { candidate } = message.payload else {
            return;
        };
        let session_id = message.session_id;

        let _negotiation = self.negotiation.lock().await;

        let limit = self.max_pending_candidates;
        let route = self.with_live(&session_id, move |slot| {
            match (&slot.transport, slot.call.remote_description_applied) {
                (Some(transport), true) => CandidateRoute::Apply(Arc::clone(transport), candidate),
                _ if slot.call.pending_remote_candidates.len() >= limit => CandidateRoute::Overflow,
                _ => {
                    slot.call.pending_remote_candidates.push_back(candidate);
                    CandidateRoute::Buffered(slot.call.pending_remote_candidates.len())
                }
            }
        });

        match route {
            None => {
                tracing::debug!("Dropping candidate for unknown session {}", session_id);
            }
            Some(CandidateRoute::Overflow) => {
                tracing::warn!(
                    "Dropping remote candidate for {}: {} already buffered",
                    session_id,
                    limit
                );
            }
            Some(CandidateRoute::Buffered(pending)) => {
                tracing::debug!(
                    "Buffered remote candidate for {} ({} pending)",
                    session_id,
                    pending
                );
            }
            Some(CandidateRoute::Apply(transport, candidate)) => {
                if let Err(e) = transport.add_remote_candidate(candidate).await {
                    self.fail_negotiation(&session_id, e, Some(SignalingPayload::Hangup))
                        .await;
                }
            }
        }
    }

    pub async fn on_hangup_received(&self, message: SignalingMessage) {
        if !self
            .terminate(&message.session_id, EndReason::RemoteHangup, None)
            .await
        {
            tracing::debug!("Ignoring hangup for session {}", message.session_id);
        }
    }

    pub async fn on_decline_received(&self, message: SignalingMessage) {
        let reason = match message.payload {
            SignalingPayload::Decline { reason } => reason,
            _ => None,
        };
        if !self
            .terminate(&message.session_id, EndReason::RemoteDeclined(reason), None)
            .await
        {
            tracing::debug!("Ignoring decline for session {}", message.session_id);
        }
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    /// Leitet eine Relay-Nachricht an den passenden Handler weiter
    pub async fn handle_message(&self, message: SignalingMessage) {
        if message.from_participant == self.participant_id {
            tracing::debug!("Ignoring own {} echo", message.event_name());
            return;
        }

        let fresh = self
            .with_live(&message.session_id, |slot| {
                if slot.call.remote_participant.is_none() {
                    slot.call.remote_participant = Some(message.from_participant.clone());
                }
                slot.call.accept_remote_seq(message.seq)
            })
            .unwrap_or(true);

        if !fresh {
            tracing::debug!(
                "Dropping duplicate {} for {} (seq {})",
                message.event_name(),
                message.session_id,
                message.seq
            );
            return;
        }

        match &message.payload {
            SignalingPayload::Offer { .. } => self.on_offer_received(message).await,
            SignalingPayload::Answer { .. } => self.on_answer_received(message).await,
            SignalingPayload::Candidate { .. } => self.on_candidate_received(message).await,
            SignalingPayload::Hangup => self.on_hangup_received(message).await,
            SignalingPayload::Decline { .. } => self.on_decline_received(message).await,
        }
    }

    /// Verarbeitet ein Ereignis des Relay-Kanals
    pub async fn handle_relay_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Message(message) => self.handle_message(message).await,
            RelayEvent::Disconnected => {
                tracing::warn!("Relay disconnected");
                self.emit(CallEvent::RelayError("relay disconnected".to_string()));
            }
            RelayEvent::Error(e) => {
                tracing::warn!("Relay error: {}", e);
                self.emit(CallEvent::RelayError(e));
            }
        }
    }

    /// Verarbeitet ein Event einer Peer Connection
    pub async fn handle_transport_event(&self, session_id: SessionId, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.forward_local_candidate(&session_id, candidate).await
            }
            TransportEvent::RemoteTrack(track) => {
                if self.is_live(&session_id) {
                    tracing::info!("Remote {:?} track for {}", track.kind, session_id);
                    self.emit(CallEvent::RemoteTrack { session_id, track });
                }
            }
            TransportEvent::Connected => {
                if self.is_live(&session_id) {
                    tracing::info!("Transport for {} connected", session_id);
                }
            }
            TransportEvent::Failed(reason) => {
                if self.is_live(&session_id) {
                    tracing::error!("Transport for {} failed: {}", session_id, reason);
                    self.terminate(
                        &session_id,
                        EndReason::TransportFailure(reason),
                        Some(SignalingPayload::Hangup),
                    )
                    .await;
                }
            }
        }
    }

    /// Event-Loop: Relay-Ereignisse und Transport-Events
    ///
    /// Läuft bis der Relay-Kanal geschlossen wird und beendet danach die
    /// aktuelle Session. Kann nur einmal gestartet werden.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<RelayEvent>) {
        let Some(mut transport_rx) = self.transport_rx.lock().take() else {
            tracing::error!("Call coordinator event loop already running");
            return;
        };

        tracing::info!("Call coordinator running for {}", self.participant_id);

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.handle_relay_event(event).await,
                    None => {
                        tracing::info!("Relay channel closed");
                        break;
                    }
                },
                Some((session_id, event)) = transport_rx.recv() => {
                    self.handle_transport_event(session_id, event).await;
                }
            }
        }

        self.shutdown().await;
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, session_id: &SessionId, state: CallState) {
        tracing::debug!("Call {} -> {:?}", session_id, state);
        self.emit(CallEvent::StateChanged {
            session_id: session_id.clone(),
            state,
        });
    }

    /// Führt `f` auf dem lebenden Slot von `session_id` aus
    fn with_live<R>(&self, session_id: &SessionId, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        self.registry.lock().live_mut(session_id).map(f)
    }

    fn is_live(&self, session_id: &SessionId) -> bool {
        self.with_live(session_id, |_| ()).is_some()
    }

    fn outbound_message(&self, call: &mut CallSession, payload: SignalingPayload) -> SignalingMessage {
        SignalingMessage::new(
            call.session_id.clone(),
            self.participant_id.clone(),
            call.next_seq(),
            payload,
        )
    }

    fn drain_local_candidates(&self, call: &mut CallSession) -> Vec<SignalingMessage> {
        call.take_pending_local_candidates()
            .into_iter()
            .map(|candidate| self.outbound_message(call, SignalingPayload::Candidate { candidate }))
            .collect()
    }

    /// Nicht-kritische Nachrichten; Fehler werden nur geloggt
    async fn send_all(&self, messages: Vec<SignalingMessage>) {
        for message in messages {
            self.send_best_effort(message).await;
        }
    }

    async fn send_best_effort(&self, message: SignalingMessage) {
        let event = message.event_name();
        let session_id = message.session_id.clone();
        if let Err(e) = self.relay.send(message).await {
            tracing::warn!("Failed to send {} for {}: {}", event, session_id, e);
        }
    }

    async fn forward_local_candidate(&self, session_id: &SessionId, candidate: IceCandidate) {
        let _outbound = self.outbound.lock().await;

        let message = self.with_live(session_id, |slot| {
            if slot.call.local_description_sent() {
                Some(self.outbound_message(&mut slot.call, SignalingPayload::Candidate { candidate }))
            } else {
                slot.call.pending_local_candidates.push(candidate);
                None
            }
        });

        match message {
            None => tracing::debug!("Dropping local candidate for stale session {}", session_id),
            Some(None) => tracing::debug!("Queued local candidate for {}", session_id),
            Some(Some(message)) => self.send_best_effort(message).await,
        }
    }

    /// Öffnet die Transport Session und hängt sie an den Slot
    async fn open_transport(
        &self,
        session_id: &SessionId,
        role: CallRole,
        media: MediaHandle,
        notify: Option<SignalingPayload>,
    ) -> Result<Arc<TransportSession>, CallError> {
        let sink = TransportEventSink::new(session_id.clone(), self.transport_tx.clone());
        let transport = match TransportSession::open(
            self.transports.as_ref(),
            role,
            media,
            Arc::clone(&self.media),
            sink,
        )
        .await
        {
            Ok(transport) => Arc::new(transport),
            Err(e) => return Err(self.fail_negotiation(session_id, e, notify).await),
        };

        let installed = self
            .with_live(session_id, |slot| slot.transport = Some(Arc::clone(&transport)))
            .is_some();
        if !installed {
            transport.close().await;
            return Err(CallError::Cancelled(session_id.clone()));
        }

        Ok(transport)
    }

    /// Markiert die Remote Description als angewendet und spielt gepufferte
    /// Candidates in Ankunftsreihenfolge ein
    ///
    /// Muss unter dem `negotiation`-Lock laufen.
    async fn replay_remote_candidates(
        &self,
        session_id: &SessionId,
        transport: &TransportSession,
    ) -> Result<usize, TransportError> {
        let pending = self
            .with_live(session_id, |slot| {
                slot.call.remote_description_applied = true;
                slot.call.take_pending_remote_candidates()
            })
            .ok_or(TransportError::Closed)?;

        let count = pending.len();
        for candidate in pending {
            transport.add_remote_candidate(candidate).await?;
        }
        if count > 0 {
            tracing::debug!("Applied {} buffered candidates for {}", count, session_id);
        }
        Ok(count)
    }

    /// Beendet die Session nach einem Verhandlungsfehler
    ///
    /// Ist die Session bereits gestoppt, ist der Fehler nur eine Folge davon.
    async fn fail_negotiation(
        &self,
        session_id: &SessionId,
        err: TransportError,
        notify: Option<SignalingPayload>,
    ) -> CallError {
        if !self.is_live(session_id) {
            return CallError::Cancelled(session_id.clone());
        }

        tracing::error!("Negotiation failed for {}: {}", session_id, err);
        self.terminate(
            session_id,
            EndReason::NegotiationFailure(err.to_string()),
            notify,
        )
        .await;
        CallError::NegotiationFailure(err.to_string())
    }

    /// Beendet eine lebende Session, `false` wenn es nichts zu tun gab
    async fn terminate(
        &self,
        session_id: &SessionId,
        reason: EndReason,
        notify: Option<SignalingPayload>,
    ) -> bool {
        let teardown = {
            let mut registry = self.registry.lock();
            self.begin_teardown(&mut registry, session_id, reason, notify)
        };

        match teardown {
            Some(teardown) => {
                self.finish_teardown(teardown).await;
                true
            }
            None => false,
        }
    }

    fn begin_teardown(
        &self,
        registry: &mut Registry,
        session_id: &SessionId,
        reason: EndReason,
        notify: Option<SignalingPayload>,
    ) -> Option<Teardown> {
        let slot = registry.live_mut(session_id)?;
        slot.closing = true;

        // Ein Anrufer ohne gesendetes Offer ist dem Peer unbekannt
        let peer_knows = slot.call.role == CallRole::Callee || slot.call.local_description_sent();
        let notify = notify
            .filter(|_| peer_knows)
            .map(|payload| self.outbound_message(&mut slot.call, payload));

        Some(Teardown {
            session_id: session_id.clone(),
            transport: slot.transport.take(),
            notify,
            reason,
        })
    }

    async fn finish_teardown(&self, teardown: Teardown) {
        let Teardown {
            session_id,
            transport,
            notify,
            reason,
        } = teardown;

        if let Some(transport) = transport {
            transport.close().await;
        }

        {
            let mut registry = self.registry.lock();
            let is_current = registry
                .current
                .as_ref()
                .is_some_and(|slot| slot.call.session_id == session_id);
            if is_current {
                if let Some(mut slot) = registry.current.take() {
                    let _ = slot.call.transition(CallState::Terminated);
                }
            }
            registry.remember_terminated(session_id.clone());
        }

        tracing::info!("Call {} ended: {:?}", session_id, reason);
        self.emit_state(&session_id, CallState::Terminated);
        self.emit(CallEvent::Ended {
            session_id,
            reason,
        });

        if let Some(message) = notify {
            let _outbound = self.outbound.lock().await;
            self.send_best_effort(message).await;
        }
    }
}

impl std::fmt::Debug for CallCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self
            .current_session()
            .map(|call| (call.state(), call.session_id));
        f.debug_struct("CallCoordinator")
            .field("participant_id", &self.participant_id)
            .field("current", &current)
            .finish()
    }
}
