//! Relay Channel Vertrag
//!
//! Der Coordinator kennt den Relay nur über dieses Trait. Eingehende
//! Nachrichten kommen als [`RelayEvent`] über einen `mpsc`-Kanal.

use super::messages::SignalingMessage;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Not connected to relay")]
    NotConnected,

    #[error("Failed to deliver message: {0}")]
    SendFailed(String),
}

/// Eingehende Ereignisse des Relays
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Nachricht des anderen Teilnehmers
    Message(SignalingMessage),

    /// Verbindung zum Relay getrennt
    Disconnected,

    /// Fehler auf Verbindungsebene
    Error(String),
}

/// Ausgehende Seite des Relays
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Sendet eine Nachricht an den anderen Teilnehmer der Session.
    async fn send(&self, message: SignalingMessage) -> Result<(), RelayError>;
}
