//! Konfiguration der Session-Engine
//!
//! Standardwerte können über Umgebungsvariablen überschrieben werden:
//! - `CALL_HANDSHAKE_TIMEOUT_SECS`: Obergrenze bis `Active`, ohne Wert kein Timeout
//! - `CALL_LOG`: zusätzliche Tracing-Direktive (Standard `peer_call=debug`)

use crate::media::MediaConstraints;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const HANDSHAKE_TIMEOUT_ENV: &str = "CALL_HANDSHAKE_TIMEOUT_SECS";
pub const LOG_DIRECTIVE_ENV: &str = "CALL_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capture-Anforderung für den lokalen Stream
    pub constraints: MediaConstraints,
    /// Kapazität des Event-Broadcasts
    pub event_capacity: usize,
    /// Fail-fast für hängende Verbindungsversuche, `None` = unbegrenzt warten
    pub handshake_timeout: Option<Duration>,
    pub log_directive: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            constraints: MediaConstraints::default(),
            event_capacity: 100,
            handshake_timeout: None,
            log_directive: "peer_call=debug".to_string(),
        }
    }
}

impl SessionConfig {
    /// Standardwerte, überschrieben durch die Umgebung
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(timeout) = parse_timeout(std::env::var(HANDSHAKE_TIMEOUT_ENV).ok()) {
            config.handshake_timeout = Some(timeout);
        }
        if let Ok(directive) = std::env::var(LOG_DIRECTIVE_ENV) {
            if !directive.trim().is_empty() {
                config.log_directive = directive;
            }
        }

        config
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }
}

fn parse_timeout(raw: Option<String>) -> Option<Duration> {
    let raw = raw?;
    match raw.trim().parse::<u64>() {
        Ok(0) => None,
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}: {:?}", HANDSHAKE_TIMEOUT_ENV, raw);
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
