//! Peer Call - Session-Kern für direkte P2P Audio/Video-Anrufe
//!
//! Zwei Endpunkte bauen über einen Broker einen direkten Anruf auf und
//! tauschen neben dem Media-Stream kleine Control-Nachrichten aus:
//! - Media: lokaler Stream, genau einmal angefordert und freigegeben
//! - Protocol: Kamera-Status und Beitritts-Hinweis als JSON
//! - Session: Handshake, Zustandsautomat, Toggles, Abbau
//! - Broker: Identität, Kanäle und Calls (Loopback für lokale Endpunkte)

pub mod broker;
#[cfg(feature = "tauri-commands")]
pub mod commands;
pub mod config;
pub mod media;
pub mod protocol;
pub mod session;

pub use broker::{Broker, Identity};
pub use config::SessionConfig;
pub use session::{CallEngine, CallStatus, SessionError, SessionEvent, SessionState};

use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging
///
/// `RUST_LOG` wird zuerst gelesen, danach kommt die Direktive aus der
/// Konfiguration hinzu. Gibt `false` zurück, wenn bereits ein globaler
/// Subscriber gesetzt war.
pub fn init_logging(config: &SessionConfig) -> bool {
    let mut filter = EnvFilter::from_default_env();
    let mut rejected = None;

    match config.log_directive.parse::<Directive>() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(err) => rejected = Some(err),
    }

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok();

    if let Some(err) = rejected {
        tracing::warn!("Ignoring log directive {:?}: {}", config.log_directive, err);
    }
    if installed {
        tracing::info!("Logging initialized");
    }

    installed
}

// ============================================================================
// TESTS
// ============================================================================
