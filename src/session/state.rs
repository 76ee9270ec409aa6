//! Beobachtbarer Session-Zustand
//!
//! [`SessionState`] ist die read-only Sicht der UI-Schicht. Änderungen
//! werden zusätzlich als [`SessionEvent`] verteilt.

use super::error::SessionError;
use crate::broker::{Identity, RemoteStream};
use crate::protocol::ControlMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CALL STATUS
// ============================================================================

/// Lebenszyklus einer Call-Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Session angelegt, Kanal noch nicht offen
    #[default]
    Idle,
    /// Control-Kanal offen, noch kein Remote-Stream
    Connecting,
    /// Remote-Stream empfangen
    Active,
    /// Beendet (terminal)
    Ended,
}

impl CallStatus {
    /// Erlaubte Übergänge, alles andere wird abgewiesen
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        match (self, next) {
            (Self::Idle, Self::Connecting)
            | (Self::Idle, Self::Active)
            | (Self::Connecting, Self::Active) => true,
            (current, Self::Ended) => current != Self::Ended,
            _ => false,
        }
    }

    pub fn is_live(self) -> bool {
        self != Self::Ended
    }
}

// ============================================================================
// MEDIA STATE
// ============================================================================

/// Lokale Schalter, nur durch lokale Toggle-Befehle geändert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaState {
    pub camera_enabled: bool,
    pub mic_enabled: bool,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            camera_enabled: true,
            mic_enabled: true,
        }
    }
}

/// Kamera der Gegenseite, nur durch empfangene `CameraState`-Nachrichten geändert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMediaState {
    pub camera_enabled: bool,
}

impl Default for RemoteMediaState {
    fn default() -> Self {
        Self {
            camera_enabled: true,
        }
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub identity: Option<Identity>,
    pub local: LocalMediaState,
    pub remote: RemoteMediaState,
    pub status: CallStatus,
    pub remote_peer: Option<Identity>,
    pub remote_stream: Option<RemoteStream>,
    pub media_ready: bool,
    pub last_error: Option<SessionError>,
}

impl SessionState {
    pub fn camera_on(&self) -> bool {
        self.local.camera_enabled
    }

    pub fn mic_on(&self) -> bool {
        self.local.mic_enabled
    }

    pub fn remote_camera_on(&self) -> bool {
        self.remote.camera_enabled
    }

    /// Übernimmt eine empfangene Control-Nachricht
    ///
    /// `CameraState` überschreibt den Remote-Status bedingungslos (letzte
    /// Zustellung gewinnt). Gibt `true` zurück, wenn sich der Zustand änderte.
    pub fn apply_control(&mut self, message: &ControlMessage) -> bool {
        match *message {
            ControlMessage::CameraState { enabled } => {
                let changed = self.remote.camera_enabled != enabled;
                self.remote.camera_enabled = enabled;
                changed
            }
            ControlMessage::JoinNotice => false,
        }
    }

    /// Setzt alles außer der Identität auf die Standardwerte zurück
    pub fn reset(&mut self) {
        *self = Self {
            identity: self.identity.take(),
            status: CallStatus::Ended,
            ..Self::default()
        };
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Hinweise für die Notification-Schicht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// Eigener Beitritt: Kanal zur Gegenseite ist offen
    Joined { peer: Identity, at: DateTime<Utc> },
    /// Gegenseite hat einen `JoinNotice` geschickt (kann mehrfach kommen)
    PeerJoined { peer: Identity, at: DateTime<Utc> },
    /// Gegenseite hat den Control-Kanal geschlossen
    PeerLeft { peer: Identity, at: DateTime<Utc> },
    /// Identität wurde in die Zwischenablage kopiert
    IdentityCopied,
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone, Serialize)]
pub enum SessionEvent {
    StateChanged(CallStatus),
    RemoteStream(RemoteStream),
    RemoteCamera(bool),
    Notice(Notice),
    Error(SessionError),
}

// ============================================================================
// TESTS
// ============================================================================
