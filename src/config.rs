//! Konfiguration
//!
//! Standardwerte lassen sich über Umgebungsvariablen oder eine JSON-Datei
//! überschreiben.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Standard Signaling URL, falls `SIGNALING_URL` nicht gesetzt ist
pub const DEFAULT_SIGNALING_URL: &str = "http://localhost:3000";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN Server Eintrag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Basis-URL des Relays (http/https/ws/wss)
    pub signaling_url: String,
    /// Eigene Teilnehmer-ID, wird als `fromParticipant` gesendet
    pub participant_id: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub heartbeat_interval_secs: u64,
    /// Kapazität der Event-Kanäle
    pub event_capacity: usize,
    /// Anzahl beendeter Session-IDs, die für Abfragen gemerkt werden
    pub terminated_history: usize,
    /// Obergrenze gepufferter Remote-Candidates vor der Remote Description
    pub max_pending_candidates: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            participant_id: uuid::Uuid::new_v4().to_string(),
            ice_servers: default_ice_servers(),
            heartbeat_interval_secs: 25,
            event_capacity: 100,
            terminated_history: 32,
            max_pending_candidates: 256,
        }
    }
}

impl CallConfig {
    /// Liest die Konfiguration aus Umgebungsvariablen
    ///
    /// `SIGNALING_URL`, `CALL_PARTICIPANT_ID` und optional
    /// `TURN_URL`/`TURN_USERNAME`/`TURN_CREDENTIAL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Ok(participant_id) = std::env::var("CALL_PARTICIPANT_ID") {
            config.participant_id = participant_id;
        }
        if let Ok(turn_url) = std::env::var("TURN_URL") {
            config.add_turn_server(
                turn_url,
                std::env::var("TURN_USERNAME").unwrap_or_default(),
                std::env::var("TURN_CREDENTIAL").unwrap_or_default(),
            );
        }

        config
    }

    /// Liest die Konfiguration aus JSON, fehlende Felder bleiben Standard
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Fügt TURN-Server Credentials hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// WebSocket-Endpunkt des Relays (`/ws`)
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.signaling_url)
            .map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::InvalidUrl(self.signaling_url.clone()))?;

        if !url.path().ends_with("/ws") {
            url.path_segments_mut()
                .map_err(|_| ConfigError::InvalidUrl(self.signaling_url.clone()))?
                .pop_if_empty()
                .push("ws");
        }

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls.len(), 3);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(25));
        assert!(!config.participant_id.is_empty());
    }

    #[test]
    fn test_websocket_url() {
        let mut config = CallConfig::default();

        config.signaling_url = "http://localhost:3000".to_string();
        assert_eq!(config.websocket_url().unwrap().as_str(), "ws://localhost:3000/ws");

        config.signaling_url = "https://relay.example.com/signal/".to_string();
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "wss://relay.example.com/signal/ws"
        );

        config.signaling_url = "wss://relay.example.com/ws".to_string();
        assert_eq!(config.websocket_url().unwrap().as_str(), "wss://relay.example.com/ws");

        config.signaling_url = "ftp://relay.example.com".to_string();
        assert!(matches!(
            config.websocket_url(),
            Err(ConfigError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_from_json_keeps_defaults() {
        let config = CallConfig::from_json(
            r#"{"participant_id": "alice", "ice_servers": [{"urls": ["turn:turn.example.com:3478"], "username": "u", "credential": "c"}]}"#,
        )
        .unwrap();

        assert_eq!(config.participant_id, "alice");
        assert_eq!(config.ice_servers[0].username, "u");
        assert_eq!(config.event_capacity, 100);
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
    }

    #[test]
    fn test_add_turn_server() {
        let mut config = CallConfig::default();
        config.add_turn_server(
            "turn:turn.example.com:3478".to_string(),
            "user".to_string(),
            "secret".to_string(),
        );
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].credential, "secret");
    }
}
