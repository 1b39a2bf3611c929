//! Test-Doubles für Medienquelle, Transport und Relay

use super::media::{LocalTrack, MediaError, MediaHandle, MediaKind, MediaSource, TrackKind};
use super::session::CallRole;
use super::transport::{
    PeerTransport, TransportError, TransportEvent, TransportEventSink, TransportFactory,
};
use crate::signaling::{
    IceCandidate, RelayChannel, RelayError, SdpType, SessionDescription, SignalingMessage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

// ============================================================================
// GATES
// ============================================================================

/// Hält eine Operation an, bis der Test sie weiterlaufen lässt
#[derive(Default)]
pub struct StepGate {
    reached: Notify,
    proceed: Notify,
}

impl StepGate {
    /// Wartet, bis die Operation das Gate erreicht hat
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn open(&self) {
        self.proceed.notify_one();
    }

    async fn pass(&self) {
        self.reached.notify_one();
        self.proceed.notified().await;
    }
}

// ============================================================================
// MEDIA
// ============================================================================

#[derive(Default)]
pub struct FakeMediaSource {
    failure: Mutex<Option<MediaError>>,
    gate: Mutex<Option<Arc<StepGate>>>,
    acquired: AtomicUsize,
    release_calls: AtomicUsize,
    held: Mutex<HashSet<String>>,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, err: MediaError) {
        *self.failure.lock() = Some(err);
    }

    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    /// `acquire` wartet, bis das Gate geöffnet wird
    pub fn gate(&self) -> Arc<StepGate> {
        let gate = Arc::new(StepGate::default());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    /// Handles, die noch nicht freigegeben wurden
    pub fn held(&self) -> usize {
        self.held.lock().len()
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaHandle, MediaError> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        if let Some(err) = self.failure.lock().clone() {
            return Err(err);
        }

        let handle = MediaHandle::new(kind);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.held.lock().insert(handle.id.clone());
        Ok(handle)
    }

    fn release(&self, handle: &MediaHandle) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.held.lock().remove(&handle.id);
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Aufgezeichnete Operation einer Fake-Verbindung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    AddTrack(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

/// Operation, die fehlschlagen soll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreateOffer,
    CreateAnswer,
    SetRemote,
    AddCandidate,
}

pub struct FakePeer {
    pub role: CallRole,
    events: TransportEventSink,
    fail_on: Option<FailPoint>,
    gate_on: Option<(FailPoint, Arc<StepGate>)>,
    ops: Mutex<Vec<PeerOp>>,
}

impl FakePeer {
    pub fn ops(&self) -> Vec<PeerOp> {
        self.ops.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.ops.lock().iter().filter(|op| **op == PeerOp::Close).count()
    }

    /// Simuliert ein Event der Verbindung
    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    fn record(&self, op: PeerOp) {
        self.ops.lock().push(op);
    }

    async fn wait_at(&self, point: FailPoint) {
        if let Some((gated, gate)) = &self.gate_on {
            if *gated == point {
                gate.pass().await;
            }
        }
    }

    fn check(&self, point: FailPoint) -> Result<(), TransportError> {
        if self.fail_on == Some(point) {
            Err(TransportError::Backend(format!("injected {:?} failure", point)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.record(PeerOp::AddTrack(track.kind));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.wait_at(FailPoint::CreateOffer).await;
        self.check(FailPoint::CreateOffer)?;
        self.record(PeerOp::CreateOffer);
        Ok(SessionDescription::offer("fake-offer-sdp"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.wait_at(FailPoint::CreateAnswer).await;
        self.check(FailPoint::CreateAnswer)?;
        self.record(PeerOp::CreateAnswer);
        Ok(SessionDescription::answer("fake-answer-sdp"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(PeerOp::SetLocal(desc.sdp_type));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.check(FailPoint::SetRemote)?;
        self.record(PeerOp::SetRemote(desc.sdp_type));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.check(FailPoint::AddCandidate)?;
        self.record(PeerOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(PeerOp::Close);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    fail_create: AtomicBool,
    fail_on: Mutex<Option<FailPoint>>,
    create_gate: Mutex<Option<Arc<StepGate>>>,
    gate_on: Mutex<Option<(FailPoint, Arc<StepGate>)>>,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_on(&self, point: FailPoint) {
        *self.fail_on.lock() = Some(point);
    }

    /// `create` hält am zurückgegebenen Gate an
    pub fn gate_create(&self) -> Arc<StepGate> {
        let gate = Arc::new(StepGate::default());
        *self.create_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Neue Verbindungen halten bei `point` an
    pub fn gate_on(&self, point: FailPoint) -> Arc<StepGate> {
        let gate = Arc::new(StepGate::default());
        *self.gate_on.lock() = Some((point, Arc::clone(&gate)));
        gate
    }

    pub fn created_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        role: CallRole,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let gate = self.create_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Backend("injected create failure".to_string()));
        }

        let peer = Arc::new(FakePeer {
            role,
            events,
            fail_on: *self.fail_on.lock(),
            gate_on: self.gate_on.lock().clone(),
            ops: Mutex::new(Vec::new()),
        });
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ============================================================================
// RELAY
// ============================================================================

#[derive(Default)]
pub struct FakeRelay {
    sent: Mutex<Vec<SignalingMessage>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl FakeRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lässt das Senden aller Nachrichten vom Typ `event` fehlschlagen
    pub fn fail_event(&self, event: &'static str) {
        self.failing.lock().insert(event);
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_events(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|m| m.event_name()).collect()
    }
}

#[async_trait]
impl RelayChannel for FakeRelay {
    async fn send(&self, message: SignalingMessage) -> Result<(), RelayError> {
        if self.failing.lock().contains(message.event_name()) {
            return Err(RelayError::SendFailed(format!(
                "injected {} failure",
                message.event_name()
            )));
        }
        self.sent.lock().push(message);
        Ok(())
    }
}
