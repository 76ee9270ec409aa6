//! Schnittstelle zum Signaling/Identity-Broker
//!
//! Der Broker vergibt die Identität, vermittelt Control-Kanäle und
//! Media-Calls zwischen zwei Identitäten und meldet eingehende Kanäle und
//! Anrufe als [`BrokerEvent`]. Sein eigenes Protokoll ist nicht Teil dieser
//! Crate.

use crate::media::{MediaHandle, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer {0} is not reachable")]
    PeerUnavailable(Identity),

    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Media call closed")]
    CallClosed,

    #[error("Broker has been destroyed")]
    Destroyed,
}

// ============================================================================
// IDENTITY
// ============================================================================

/// Opaker Name eines Endpunkts, einmalig vom Broker vergeben
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for Identity {
    fn from(token: String) -> Self {
        Self(token)
    }
}

// ============================================================================
// REMOTE STREAM
// ============================================================================

/// Beschreibung des empfangenen Streams der Gegenseite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    pub peer: Identity,
    pub stream_id: String,
    pub tracks: Vec<TrackKind>,
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Seitenkanal für Control-Nachrichten
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn remote(&self) -> &Identity;

    /// Wartet bis der Kanal offen ist (oder endgültig fehlschlägt)
    async fn opened(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    /// Best-effort Versand, keine Bestätigung
    fn send(&self, frame: String) -> Result<(), BrokerError>;

    /// Nächster Frame, `None` sobald der Kanal geschlossen ist
    async fn recv(&self) -> Option<String>;

    /// Mehrfaches Schließen ist ein No-op
    fn close(&self);
}

/// Media-Call zu einer Gegenseite
#[async_trait]
pub trait MediaCall: Send + Sync {
    fn remote(&self) -> &Identity;

    /// Nimmt einen eingehenden Anruf an, optional ohne lokalen Stream
    fn answer(&self, local: Option<MediaHandle>) -> Result<(), BrokerError>;

    /// Erstes Stream-Event der Gegenseite
    async fn remote_stream(&self) -> Result<RemoteStream, BrokerError>;

    /// Mehrfaches Schließen ist ein No-op
    fn close(&self);
}

/// Eingehende Ereignisse des Brokers
///
/// Zwischen Anruf- und Kanal-Ereignissen gibt es keine Reihenfolge-Garantie.
#[derive(Clone)]
pub enum BrokerEvent {
    /// Eingehender Media-Call
    Call(Arc<dyn MediaCall>),
    /// Eingehender Control-Kanal
    Connection(Arc<dyn ControlChannel>),
    /// Fehler auf Broker-Ebene
    Error(BrokerError),
    /// Broker-Verbindung beendet
    Disconnected,
}

impl std::fmt::Debug for BrokerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call(call) => f.debug_tuple("Call").field(call.remote()).finish(),
            Self::Connection(channel) => {
                f.debug_tuple("Connection").field(channel.remote()).finish()
            }
            Self::Error(err) => f.debug_tuple("Error").field(err).finish(),
            Self::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// Signaling/Identity-Broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Registriert den Endpunkt und liefert seine Identität
    async fn open(&self) -> Result<Identity, BrokerError>;

    /// Öffnet einen Control-Kanal zur Gegenseite
    fn connect(&self, remote: &Identity) -> Result<Arc<dyn ControlChannel>, BrokerError>;

    /// Startet einen Media-Call mit dem lokalen Stream
    fn call(&self, remote: &Identity, local: MediaHandle)
        -> Result<Arc<dyn MediaCall>, BrokerError>;

    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent>;

    /// Zerstört Verbindung und Identität, mehrfacher Aufruf ist ein No-op
    fn destroy(&self);
}
