//! Media Acquisition - Besitzer des lokalen Streams
//!
//! Fordert den lokalen Stream genau einmal bei der Hardware an und teilt
//! ihn danach als [`MediaHandle`]. Parallele Aufrufe warten auf dieselbe
//! laufende Anforderung. `release()` ist der einzige Weg, den Stream zu
//! stoppen.

use super::stream::{CaptureDevice, LocalStream, MediaConstraints, MediaError, MediaHandle};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;

type PendingCapture = Shared<BoxFuture<'static, Result<MediaHandle, MediaError>>>;

enum Slot {
    Empty,
    Pending { attempt: u64, capture: PendingCapture },
    Ready(MediaHandle),
}

struct AcquisitionInner {
    slot: Slot,
    next_attempt: u64,
}

/// Verwaltet den lokalen Audio/Video-Stream
pub struct MediaAcquisition {
    device: Arc<dyn CaptureDevice>,
    constraints: MediaConstraints,
    inner: Mutex<AcquisitionInner>,
}

impl MediaAcquisition {
    pub fn new(device: Arc<dyn CaptureDevice>, constraints: MediaConstraints) -> Self {
        Self {
            device,
            constraints,
            inner: Mutex::new(AcquisitionInner {
                slot: Slot::Empty,
                next_attempt: 0,
            }),
        }
    }

    /// Gibt den lokalen Stream zurück und fordert ihn bei Bedarf an
    ///
    /// Ein vorhandener Stream wird ohne Hardware-Zugriff zurückgegeben,
    /// eine laufende Anforderung wird mitbenutzt. Wird währenddessen
    /// `release()` aufgerufen, endet der Aufruf mit [`MediaError::Released`]
    /// und der verspätet gelieferte Stream wird sofort gestoppt.
    pub async fn acquire(&self) -> Result<MediaHandle, MediaError> {
        let (attempt, capture) = {
            let mut inner = self.inner.lock();
            match &inner.slot {
                Slot::Ready(handle) => return Ok(Arc::clone(handle)),
                Slot::Pending { attempt, capture } => (*attempt, capture.clone()),
                Slot::Empty => {
                    let attempt = inner.next_attempt;
                    inner.next_attempt += 1;

                    tracing::info!(
                        "Requesting local capture (video: {}, audio: {:?})",
                        self.constraints.video,
                        self.constraints.audio
                    );

                    let device = Arc::clone(&self.device);
                    let constraints = self.constraints.clone();
                    let capture = async move {
                        let tracks = device.request_capture(&constraints).await?;
                        Ok(Arc::new(LocalStream::new(tracks)))
                    }
                    .boxed()
                    .shared();

                    inner.slot = Slot::Pending {
                        attempt,
                        capture: capture.clone(),
                    };
                    (attempt, capture)
                }
            }
        };

        let result = capture.await;

        let mut inner = self.inner.lock();
        let still_pending = matches!(
            inner.slot,
            Slot::Pending { attempt: current, .. } if current == attempt
        );

        match result {
            Ok(handle) => {
                if still_pending {
                    tracing::info!("Local media ready: {:?}", handle);
                    inner.slot = Slot::Ready(Arc::clone(&handle));
                    return Ok(handle);
                }
                if let Slot::Ready(current) = &inner.slot {
                    if Arc::ptr_eq(current, &handle) {
                        return Ok(handle);
                    }
                }
                tracing::debug!("Acquisition finished after release, stopping stream");
                handle.stop();
                Err(MediaError::Released)
            }
            Err(err) => {
                if still_pending {
                    tracing::warn!("Local media unavailable: {}", err);
                    inner.slot = Slot::Empty;
                }
                Err(err)
            }
        }
    }

    /// Der bereits erworbene Stream, ohne anzufordern
    pub fn current(&self) -> Option<MediaHandle> {
        match &self.inner.lock().slot {
            Slot::Ready(handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Pending { .. })
    }

    /// Stoppt den Stream und verwirft laufende Anforderungen
    ///
    /// Gibt `true` zurück, wenn dabei Tracks gestoppt wurden.
    pub fn release(&self) -> bool {
        let previous = std::mem::replace(&mut self.inner.lock().slot, Slot::Empty);
        match previous {
            Slot::Ready(handle) => handle.stop(),
            Slot::Pending { .. } => {
                tracing::debug!("Discarding in-flight media acquisition");
                false
            }
            Slot::Empty => false,
        }
    }
}

impl std::fmt::Debug for MediaAcquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaAcquisition")
            .field("constraints", &self.constraints)
            .field("ready", &self.is_ready())
            .field("pending", &self.is_pending())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
