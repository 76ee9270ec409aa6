//! Session Module - Anruf-Lebenszyklus und UI-Zustand
//!
//! Dieses Modul verwaltet:
//! - Den Zustandsautomaten Idle -> Connecting -> Active -> Ended
//! - Lokale und entfernte Kamera/Mikrofon-Schalter
//! - Den Abbau über `leave_call()`
//!

mod engine;
mod error;
mod state;

pub use engine::{CallEngine, Clipboard};
pub use error::SessionError;
pub use state::{
    CallStatus, LocalMediaState, Notice, RemoteMediaState, SessionEvent, SessionState,
};
