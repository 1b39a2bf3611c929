//! Call Signaling - Verhandlungskern für 1:1 Audio/Video-Anrufe
//!
//! Ein Zustandsautomat für WebRTC-Anrufe mit:
//! - WebSocket-Relay als Signaling-Kanal
//! - WebRTC Peer Connections für den Medienpfad
//! - Genau einer aktiven Call Session pro Prozess

pub mod call_engine;
pub mod config;
pub mod signaling;

use call_engine::{CallCoordinator, MediaSource, WebRtcTransportFactory};
use config::CallConfig;
use signaling::{SignalingClient, SignalingError};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub use call_engine::{CallError, CallEvent, CallState, EndReason, MediaKind};

/// Standard-Filter, falls `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "call_signaling=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// Mehrfache Aufrufe sind erlaubt, nur der erste installiert den Subscriber.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::debug!("Tracing initialized");
    }
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Verbundener Anruf-Stack: Relay, Coordinator und Event-Loop
pub struct CallApp {
    pub coordinator: Arc<CallCoordinator>,
    pub signaling: Arc<SignalingClient>,
    dispatcher: JoinHandle<()>,
}

impl CallApp {
    /// Verbindet mit dem Relay und startet den Coordinator
    pub async fn connect(
        config: CallConfig,
        media: Arc<dyn MediaSource>,
    ) -> Result<Self, SignalingError> {
        tracing::info!("Connecting call stack as '{}'...", config.participant_id);

        let mut client = SignalingClient::new(&config)?;
        let inbound = client.connect().await?;
        let signaling = Arc::new(client);
        Arc::clone(&signaling).start_heartbeat();

        let coordinator = Arc::new(CallCoordinator::new(
            &config,
            Arc::clone(&signaling) as Arc<dyn signaling::RelayChannel>,
            media,
            Arc::new(WebRtcTransportFactory::new(&config)),
        ));
        let dispatcher = tokio::spawn(Arc::clone(&coordinator).run(inbound));

        Ok(Self {
            coordinator,
            signaling,
            dispatcher,
        })
    }

    pub fn is_running(&self) -> bool {
        !self.dispatcher.is_finished()
    }

    /// Beendet den laufenden Anruf und stoppt die Event-Loop
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
        self.signaling.disconnect().await;
        self.dispatcher.abort();
        if let Err(e) = self.dispatcher.await {
            if !e.is_cancelled() {
                tracing::warn!("Call dispatcher ended with error: {}", e);
            }
        }
        tracing::info!("Call stack shut down");
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("coordinator", &self.coordinator)
            .field("signaling", &self.signaling)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }

    #[tokio::test]
    async fn test_connect_fails_without_relay() {
        let config = CallConfig {
            signaling_url: "http://127.0.0.1:1".to_string(),
            ..CallConfig::default()
        };
        let media: Arc<dyn MediaSource> = Arc::new(NoMedia);

        let result = CallApp::connect(config, media).await;
        assert!(matches!(result, Err(SignalingError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_relay() {
        use futures::StreamExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut saw_close = false;
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    saw_close = true;
                }
            }
            saw_close
        });

        let config = CallConfig {
            signaling_url: format!("http://{}", addr),
            participant_id: "alice".to_string(),
            ..CallConfig::default()
        };
        let app = CallApp::connect(config, Arc::new(NoMedia)).await.unwrap();
        let signaling = Arc::clone(&app.signaling);
        assert!(signaling.is_connected());

        app.shutdown().await;
        assert!(!signaling.is_connected());

        let saw_close = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(saw_close);
    }

    struct NoMedia;

    #[async_trait::async_trait]
    impl MediaSource for NoMedia {
        async fn acquire(
            &self,
            _kind: MediaKind,
        ) -> Result<call_engine::MediaHandle, call_engine::MediaError> {
            Err(call_engine::MediaError::DeviceUnavailable(
                "test".to_string(),
            ))
        }

        fn release(&self, _handle: &call_engine::MediaHandle) {}
    }
}
