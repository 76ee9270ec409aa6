//! Message Types für den Control-Kanal
//!
//! Wire-Format: JSON-Objekt mit `type`-Tag, z.B.
//! `{"type":"camera","enabled":false}` oder `{"type":"joined"}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to encode control message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Malformed control message: {0}")]
    Decode(#[source] serde_json::Error),
}

// ============================================================================
// CONTROL MESSAGES
// ============================================================================

/// Nachrichten zwischen den beiden Endpunkten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Kamera des Absenders an/aus
    #[serde(rename = "camera")]
    CameraState { enabled: bool },

    /// Absender ist dem Anruf beigetreten (rein informativ)
    #[serde(rename = "joined")]
    JoinNotice,
}

/// Serialisiert eine Nachricht für den Kanal
pub fn encode(message: &ControlMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::Encode)
}

/// Parst einen eingehenden Frame
///
/// Unbekannte Zusatzfelder werden ignoriert, unbekannte Typen sind ein Fehler.
pub fn decode(frame: &str) -> Result<ControlMessage, ProtocolError> {
    serde_json::from_str(frame).map_err(ProtocolError::Decode)
}

// ============================================================================
// TESTS
// ============================================================================
