//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Anmeldung mit der eigenen Teilnehmer-ID
//! - Heartbeat-Keeping
//! - Eingehende Peer-Nachrichten als [`RelayEvent`] weiterleiten

use super::messages::*;
use super::relay::{RelayChannel, RelayError, RelayEvent};
use crate::config::{CallConfig, ConfigError};
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<SignalingError> for RelayError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::NotConnected => RelayError::NotConnected,
            other => RelayError::SendFailed(other.to_string()),
        }
    }
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
pub struct SignalingClient {
    websocket_url: Url,
    participant_id: String,
    heartbeat_interval: Duration,
    event_capacity: usize,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<Message>>,
    closed: Arc<Notify>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(config: &CallConfig) -> Result<Self, SignalingError> {
        Ok(Self {
            websocket_url: config.websocket_url()?,
            participant_id: config.participant_id.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            event_capacity: config.event_capacity.max(1),
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            closed: Arc::new(Notify::new()),
        })
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Relay und meldet den Teilnehmer an
    ///
    /// Gibt den Empfänger für eingehende Relay-Ereignisse zurück.
    pub async fn connect(&mut self) -> Result<mpsc::Receiver<RelayEvent>, SignalingError> {
        tracing::info!("Connecting to signaling server: {}", self.websocket_url);

        let (ws_stream, _) = connect_async(self.websocket_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(self.event_capacity);
        self.tx = Some(tx);
        self.state.write().is_connected = true;

        let (event_tx, event_rx) = mpsc::channel::<RelayEvent>(self.event_capacity);

        // Read-Task
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = Self::parse_frame(&text) {
                            if event_tx.send(event).await.is_err() {
                                tracing::debug!("Relay event receiver dropped");
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        let _ = event_tx.send(RelayEvent::Error(e.to_string())).await;
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        // Write-Task
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    state.write().is_connected = false;
                    break;
                }
                if closing {
                    tracing::debug!("Close frame sent, stopping write task");
                    break;
                }
            }
        });

        self.send_frame(&JoinFrame::new(self.participant_id.clone()))
            .await?;

        Ok(event_rx)
    }

    /// Trennt die Verbindung zum Relay
    ///
    /// Stoppt den Heartbeat und schließt den WebSocket mit einem Close-Frame.
    /// Danach schlagen alle Sendeversuche mit `NotConnected` fehl.
    pub async fn disconnect(&self) {
        let was_connected = std::mem::replace(&mut self.state.write().is_connected, false);
        self.closed.notify_waiters();

        if !was_connected {
            return;
        }
        tracing::info!("Disconnecting from signaling server");

        if let Some(tx) = &self.tx {
            if tx.send(Message::Close(None)).await.is_err() {
                tracing::debug!("Write task already stopped");
            }
        }
    }

    /// Sendet einen Heartbeat
    pub async fn send_heartbeat(&self) -> Result<(), SignalingError> {
        let frame = HeartbeatFrame::new(self.participant_id.clone(), Utc::now().timestamp_millis());
        self.send_frame(&frame).await
    }

    /// Startet einen Heartbeat-Task
    pub fn start_heartbeat(self: Arc<Self>) {
        let client = Arc::clone(&self);
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(client.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = closed.notified() => {
                        tracing::info!("Heartbeat: client closed, stopping heartbeat task");
                        break;
                    }
                }
                if !client.is_connected() {
                    tracing::info!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = client.send_heartbeat().await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }

    /// Serialisiert und sendet einen Frame
    async fn send_frame<T: serde::Serialize>(&self, payload: &T) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let msg_string =
            serde_json::to_string(payload).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.send(Message::Text(msg_string))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Übersetzt einen Text-Frame in ein Relay-Ereignis
    fn parse_frame(text: &str) -> Option<RelayEvent> {
        if let Ok(message) = serde_json::from_str::<SignalingMessage>(text) {
            return Some(RelayEvent::Message(message));
        }

        match serde_json::from_str::<ServerNotice>(text) {
            Ok(ServerNotice::Pong { .. }) => None,
            Ok(ServerNotice::Error { code, message }) => {
                tracing::error!("Server error {}: {}", code, message);
                Some(RelayEvent::Error(format!("{}: {}", code, message)))
            }
            Err(_) => {
                tracing::debug!("Ignoring unknown relay frame: {}", text);
                None
            }
        }
    }
}

#[async_trait]
impl RelayChannel for SignalingClient {
    async fn send(&self, message: SignalingMessage) -> Result<(), RelayError> {
        tracing::debug!(
            "Relay send {} for session {} (seq {})",
            message.event_name(),
            message.session_id,
            message.seq
        );
        self.send_frame(&message).await.map_err(RelayError::from)
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("websocket_url", &self.websocket_url.as_str())
            .field("participant_id", &self.participant_id)
            .field("state", &*self.state.read())
            .finish()
    }
}
