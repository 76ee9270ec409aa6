//! Synthetisches Capture-Gerät
//!
//! Liefert Software-Tracks ohne Hardware. Wird für Headless-Betrieb und
//! Tests verwendet: die Anforderung kann verzögert (Gate) oder mit einem
//! Fehler beantwortet werden.

use super::stream::{CaptureDevice, CaptureTrack, MediaConstraints, MediaError, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

// ============================================================================
// TRACK PROBE
// ============================================================================

/// Beobachtbarer Zustand eines synthetischen Tracks
#[derive(Debug)]
pub struct TrackProbe {
    kind: TrackKind,
    enabled: AtomicBool,
    stop_calls: AtomicUsize,
}

impl TrackProbe {
    fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            enabled: AtomicBool::new(true),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Wie oft `stop()` auf dem Track aufgerufen wurde
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

struct SyntheticTrack {
    probe: Arc<TrackProbe>,
}

impl CaptureTrack for SyntheticTrack {
    fn kind(&self) -> TrackKind {
        self.probe.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.probe.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.probe.stop_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// CAPTURE GATE
// ============================================================================

/// Gibt zurückgehaltene Capture-Anforderungen frei
pub struct CaptureGate {
    tx: watch::Sender<bool>,
}

impl CaptureGate {
    pub fn open(&self) {
        self.tx.send_replace(true);
    }
}

// ============================================================================
// SYNTHETIC CAPTURE
// ============================================================================

/// Capture-Gerät ohne Hardware
pub struct SyntheticCapture {
    failure: Option<String>,
    gate: Option<watch::Receiver<bool>>,
    requests: AtomicUsize,
    last_constraints: Mutex<Option<MediaConstraints>>,
    probes: Mutex<Vec<Arc<TrackProbe>>>,
}

impl SyntheticCapture {
    /// Liefert Tracks sofort
    pub fn new() -> Self {
        Self {
            failure: None,
            gate: None,
            requests: AtomicUsize::new(0),
            last_constraints: Mutex::new(None),
            probes: Mutex::new(Vec::new()),
        }
    }

    /// Liefert Tracks erst, wenn das zurückgegebene Gate geöffnet wird
    pub fn gated() -> (Self, CaptureGate) {
        let (tx, rx) = watch::channel(false);
        let capture = Self {
            gate: Some(rx),
            ..Self::new()
        };
        (capture, CaptureGate { tx })
    }

    /// Schlägt jede Anforderung fehl (z.B. Berechtigung verweigert)
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::new()
        }
    }

    /// Anzahl der Hardware-Anforderungen
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn last_constraints(&self) -> Option<MediaConstraints> {
        self.last_constraints.lock().clone()
    }

    /// Alle bisher erzeugten Tracks
    pub fn tracks(&self) -> Vec<Arc<TrackProbe>> {
        self.probes.lock().clone()
    }

    /// Zuletzt erzeugter Track der Art
    pub fn track(&self, kind: TrackKind) -> Option<Arc<TrackProbe>> {
        self.probes
            .lock()
            .iter()
            .rev()
            .find(|p| p.kind == kind)
            .cloned()
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureDevice for SyntheticCapture {
    async fn request_capture(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Box<dyn CaptureTrack>>, MediaError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.last_constraints.lock() = Some(constraints.clone());

        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            let opened = gate.wait_for(|open| *open).await.is_ok();
            if !opened {
                return Err(MediaError::Unavailable("capture gate dropped".to_string()));
            }
        }

        if let Some(reason) = &self.failure {
            tracing::warn!("Synthetic capture refused: {}", reason);
            return Err(MediaError::Unavailable(reason.clone()));
        }

        let mut kinds = Vec::new();
        if constraints.video {
            kinds.push(TrackKind::Video);
        }
        if constraints.audio.is_some() {
            kinds.push(TrackKind::Audio);
        }

        let mut probes = self.probes.lock();
        let tracks = kinds
            .into_iter()
            .map(|kind| {
                let probe = Arc::new(TrackProbe::new(kind));
                probes.push(Arc::clone(&probe));
                Box::new(SyntheticTrack { probe }) as Box<dyn CaptureTrack>
            })
            .collect();

        Ok(tracks)
    }
}
