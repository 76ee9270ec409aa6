//! Control Protocol - Nachrichten über den Seitenkanal
//!
//! Kleine JSON-Nachrichten neben dem Media-Stream: Kamera-Status und
//! Beitritts-Hinweis. Keine Sequenznummern, keine Bestätigung.

mod messages;

pub use messages::{decode, encode, ControlMessage, ProtocolError};
