//! Lokaler Media-Stream und Hardware-Schnittstelle
//!
//! Die Hardware-Schicht liefert einzelne Capture-Tracks, die hier zu einem
//! [`LocalStream`] gebündelt werden. Der Stream wird als [`MediaHandle`]
//! geteilt (Preview, ausgehender Anruf, Annahme), aber genau einmal gestoppt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Cannot access camera/microphone: {0}")]
    Unavailable(String),

    #[error("Media acquisition was released before it completed")]
    Released,
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Art eines Capture-Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Audio-Verarbeitung, die von der Hardware angefordert wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Capture-Anforderung an die Hardware-Schicht
///
/// Standard: Video an, Audio mit Echo-Unterdrückung und Rauschunterdrückung.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: Option<AudioConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: Some(AudioConstraints::default()),
        }
    }
}

// ============================================================================
// HARDWARE SEAM
// ============================================================================

/// Ein einzelner Capture-Track der Hardware-Schicht
pub trait CaptureTrack: Send + Sync {
    fn kind(&self) -> TrackKind;

    /// Aktiviert/deaktiviert den Track ohne die Hardware freizugeben
    fn set_enabled(&self, enabled: bool);

    /// Gibt die Hardware frei
    fn stop(&self);
}

/// Zugriff auf Kamera/Mikrofon (`requestCapture`)
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn request_capture(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Box<dyn CaptureTrack>>, MediaError>;
}

// ============================================================================
// LOCAL STREAM
// ============================================================================

/// Geteilter Zugriff auf den lokalen Stream
pub type MediaHandle = Arc<LocalStream>;

/// Gebündelte lokale Capture-Tracks
pub struct LocalStream {
    id: String,
    tracks: Vec<Box<dyn CaptureTrack>>,
    stopped: AtomicBool,
}

impl LocalStream {
    pub fn new(tracks: Vec<Box<dyn CaptureTrack>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_track(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    pub fn track_kinds(&self) -> Vec<TrackKind> {
        self.tracks.iter().map(|t| t.kind()).collect()
    }

    /// Setzt `enabled` auf allen Tracks der Art
    ///
    /// Gibt `false` zurück, wenn kein passender Track existiert oder der
    /// Stream bereits gestoppt ist.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        if self.is_stopped() {
            return false;
        }

        let mut applied = false;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            applied = true;
        }
        applied
    }

    /// Stoppt alle Tracks
    ///
    /// Nur der erste Aufruf gibt die Hardware frei und liefert `true`,
    /// jeder weitere ist ein No-op.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }

        for track in &self.tracks {
            track.stop();
        }
        tracing::info!("Local stream {} stopped ({} tracks)", self.id, self.tracks.len());
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.track_kinds())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
