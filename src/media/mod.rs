//! Local media surface: device inventory, track handles, capture backends.
//!
//! # Architecture
//!
//! - [`MediaBackend`]: injected capture seam (`getUserMedia`-shaped)
//! - [`LocalTrack`]: one live outgoing track with an idempotent stop
//! - [`DeviceManager`]: enumeration and live input switching
//! - [`ScreenShareCoordinator`]: camera/screen track substitution
//! - [`testing::StaticMediaBackend`]: in-process backend for tests

mod backend;
mod devices;
mod screen_share;
pub mod testing;

pub use backend::{LocalTrack, MediaBackend, MediaError};
pub use devices::{DeviceManager, SwitchOutcome};
pub use screen_share::ScreenShareCoordinator;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

/// Opaque capture-device identifier, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One enumerated input device. The label may be empty until capture
/// permission has been granted at least once.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub label: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(id),
            label: label.into(),
        }
    }
}

/// Snapshot of available input devices; refreshed on demand, never
/// persisted across calls.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceInventory {
    pub audio_inputs: Vec<DeviceDescriptor>,
    pub video_inputs: Vec<DeviceDescriptor>,
}

impl DeviceInventory {
    pub fn inputs(&self, kind: TrackKind) -> &[DeviceDescriptor] {
        match kind {
            TrackKind::Audio => &self.audio_inputs,
            TrackKind::Video => &self.video_inputs,
        }
    }

    pub fn contains(&self, kind: TrackKind, id: &DeviceId) -> bool {
        self.inputs(kind).iter().any(|d| &d.id == id)
    }
}

/// Capture devices to prefer when a negotiation session acquires its
/// initial tracks; `None` means the system default.
#[derive(Debug, Clone, Default)]
pub struct PreferredDevices {
    pub audio: Option<DeviceId>,
    pub video: Option<DeviceId>,
}
