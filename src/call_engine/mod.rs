//! Call Engine Module - Session-Zustand und Verhandlung
//!
//! Dieses Modul verwaltet:
//! - Call Sessions und ihren Zustandsautomaten
//! - Transport Sessions (WebRTC Peer Connections)
//! - Lokale Medienquellen
//! - Den Coordinator, der Relay-Nachrichten und Benutzeraktionen verbindet

mod coordinator;
mod media;
mod session;
mod transport;
mod webrtc_peer;

#[cfg(test)]
mod testing;

pub use coordinator::{CallCoordinator, CallError, CallEvent, EndReason};
#[cfg(feature = "device-audio")]
pub use media::DeviceMediaSource;
pub use media::{LocalTrack, MediaError, MediaHandle, MediaKind, MediaSource, TrackKind};
pub use session::{CallRole, CallSession, CallState, InvalidTransition};
pub use transport::{
    PeerTransport, RemoteTrack, TransportError, TransportEvent, TransportEventSink,
    TransportFactory, TransportSession,
};
pub use webrtc_peer::{WebRtcPeer, WebRtcTransportFactory};
