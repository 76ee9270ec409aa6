//! Broker Module - Signaling/Identity-Kollaborateur
//!
//! Dieses Modul definiert:
//! - Die Broker-Schnittstelle (Identität, Control-Kanäle, Media-Calls)
//! - Einen In-Process Loopback-Broker für lokale Endpunkte
//!

mod collaborator;
pub mod loopback;

pub use collaborator::{
    Broker, BrokerError, BrokerEvent, ControlChannel, Identity, MediaCall, RemoteStream,
};
