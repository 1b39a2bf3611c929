//! Lokale Medienquelle
//!
//! Die eigentliche Geräte-Aufnahme liegt außerhalb dieses Crates. Der
//! Coordinator fordert über [`MediaSource`] ein [`MediaHandle`] an und gibt
//! es beim Schließen der Transport Session wieder frei.
//!
//! Mit dem Feature `device-audio` prüft [`DeviceMediaSource`] über cpal,
//! ob ein Mikrofon verfügbar ist.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),
}

// ============================================================================
// MEDIA TYPES
// ============================================================================

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Voice,
}

impl MediaKind {
    pub fn has_video(&self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Ein lokaler Track, der an die Peer Connection gehängt wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Aufnahme-Handle einer Medienquelle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: String,
    pub kind: MediaKind,
    pub tracks: Vec<LocalTrack>,
}

impl MediaHandle {
    /// Erstellt ein Handle mit den Standard-Tracks für `kind`
    ///
    /// Audio ist immer dabei, Video nur bei [`MediaKind::Video`].
    pub fn new(kind: MediaKind) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let stream_id = format!("call-{}", id);

        let mut tracks = vec![LocalTrack {
            id: format!("audio-{}", id),
            kind: TrackKind::Audio,
            stream_id: stream_id.clone(),
        }];
        if kind.has_video() {
            tracks.push(LocalTrack {
                id: format!("video-{}", id),
                kind: TrackKind::Video,
                stream_id,
            });
        }

        Self { id, kind, tracks }
    }
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Fordert Aufnahmegeräte für `kind` an
    async fn acquire(&self, kind: MediaKind) -> Result<MediaHandle, MediaError>;

    /// Gibt ein Handle frei. Mehrfaches Freigeben ist erlaubt.
    fn release(&self, handle: &MediaHandle);
}

// ============================================================================
// DEVICE MEDIA SOURCE (cpal)
// ============================================================================

#[cfg(feature = "device-audio")]
pub use device::DeviceMediaSource;

#[cfg(feature = "device-audio")]
mod device {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait};
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Prüft vor jedem Anruf das Standard-Mikrofon
    ///
    /// Video-Aufnahme wird von cpal nicht abgedeckt, Videoanrufe schlagen
    /// daher mit `DeviceUnavailable` fehl.
    #[derive(Debug, Default)]
    pub struct DeviceMediaSource {
        held: Mutex<HashSet<String>>,
    }

    impl DeviceMediaSource {
        pub fn new() -> Self {
            Self::default()
        }

        /// Anzahl aktuell ausgegebener Handles
        pub fn held_handles(&self) -> usize {
            self.held.lock().len()
        }

        fn check_input() -> Result<(), MediaError> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| MediaError::DeviceUnavailable("no audio input device".to_string()))?;

            let config = device.default_input_config().map_err(|e| {
                let reason = e.to_string();
                match e {
                    cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                        MediaError::DeviceBusy(reason)
                    }
                    cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
                        MediaError::DeviceUnavailable(reason)
                    }
                    cpal::DefaultStreamConfigError::BackendSpecific { .. } => {
                        MediaError::PermissionDenied(reason)
                    }
                }
            })?;

            tracing::info!(
                "Audio input available: {} Hz, {} channel(s)",
                config.sample_rate().0,
                config.channels()
            );
            Ok(())
        }
    }

    #[async_trait]
    impl MediaSource for DeviceMediaSource {
        async fn acquire(&self, kind: MediaKind) -> Result<MediaHandle, MediaError> {
            if kind.has_video() {
                return Err(MediaError::DeviceUnavailable(
                    "no video capture backend".to_string(),
                ));
            }

            tokio::task::spawn_blocking(Self::check_input)
                .await
                .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))??;

            let handle = MediaHandle::new(kind);
            self.held.lock().insert(handle.id.clone());
            Ok(handle)
        }

        fn release(&self, handle: &MediaHandle) {
            if self.held.lock().remove(&handle.id) {
                tracing::debug!("Released media handle {}", handle.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_handle_has_audio_only() {
        let handle = MediaHandle::new(MediaKind::Voice);
        assert_eq!(handle.tracks.len(), 1);
        assert_eq!(handle.tracks[0].kind, TrackKind::Audio);
    }

    #[test]
    fn test_video_handle_shares_stream() {
        let handle = MediaHandle::new(MediaKind::Video);
        assert_eq!(handle.tracks.len(), 2);
        assert_eq!(handle.tracks[1].kind, TrackKind::Video);
        assert_eq!(handle.tracks[0].stream_id, handle.tracks[1].stream_id);
        assert_ne!(MediaHandle::new(MediaKind::Video).id, handle.id);
    }
}
