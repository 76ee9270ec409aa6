//! Fehler, die der UI-Schicht gemeldet werden

use crate::broker::BrokerError;
use crate::media::MediaError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SessionError {
    #[error("Cannot access camera/microphone: {0}")]
    MediaUnavailable(String),

    #[error("Enter the remote ID")]
    EmptyRemoteId,

    #[error("Your media is not ready yet")]
    MediaNotReady,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No identity assigned yet")]
    IdentityUnavailable,

    #[error("Clipboard error: {0}")]
    Clipboard(String),
}

impl From<BrokerError> for SessionError {
    fn from(err: BrokerError) -> Self {
        Self::ConnectionFailed(err.to_string())
    }
}

impl From<MediaError> for SessionError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::Unavailable(reason) => Self::MediaUnavailable(reason),
            MediaError::Released => Self::MediaNotReady,
        }
    }
}
