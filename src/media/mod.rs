//! Media Module - lokaler Audio/Video-Stream
//!
//! Dieses Modul verwaltet:
//! - Capture-Anforderung an die Hardware (Video + Audio mit Echo/Noise-Filter)
//! - Den geteilten lokalen Stream und dessen einmalige Freigabe
//! - Ein synthetisches Capture-Gerät für Headless-Betrieb

mod acquisition;
mod stream;
pub mod synthetic;

pub use acquisition::MediaAcquisition;
pub use stream::{
    AudioConstraints, CaptureDevice, CaptureTrack, LocalStream, MediaConstraints, MediaError,
    MediaHandle, TrackKind,
};
