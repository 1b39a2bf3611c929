//! Signaling Module - Relay-Vertrag und WebSocket Client
//!
//! Dieses Modul verwaltet die Kommunikation über den Relay:
//! - Nachrichtenformat (offer, answer, candidate, hangup, decline)
//! - [`RelayChannel`] als Schnittstelle für den Coordinator
//! - WebSocket-Verbindung aufbauen und halten
//!

mod client;
mod messages;
mod relay;

pub use client::{SignalingClient, SignalingError};
pub use messages::*;
pub use relay::{RelayChannel, RelayError, RelayEvent};
