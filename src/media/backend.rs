//! Capture backend seam and the live track handle it produces.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use webrtc::track::track_local::TrackLocal;

use super::{DeviceId, DeviceInventory, TrackKind};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// One live outgoing media track.
///
/// Cheap to clone; all clones share the stop/enabled flags. `stop` is
/// idempotent and releases the underlying capture source exactly once.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    device_id: Option<DeviceId>,
    label: String,
    rtc: Arc<dyn TrackLocal + Send + Sync>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
    ended_notify: Arc<Notify>,
}

impl LocalTrack {
    pub fn new(
        kind: TrackKind,
        device_id: Option<DeviceId>,
        label: impl Into<String>,
        rtc: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Self {
        Self {
            kind,
            device_id,
            label: label.into(),
            rtc,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
            ended: Arc::new(AtomicBool::new(false)),
            ended_notify: Arc::new(Notify::new()),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Device this track captures from; `None` for sources without a
    /// device identity (screen capture).
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device_id.as_ref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc.clone()
    }

    /// Soft mute toggle; the capture source keeps running.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Releases the capture source. Safe to call from any clone, any
    /// number of times.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("stopping local {} track ({})", self.kind, self.label);
        self.mark_ended();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Signals that the source ended on its own (e.g. the user dismissed
    /// the screen picker). Wakes every `ended` waiter.
    pub fn mark_ended(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.ended_notify.notify_waiters();
        }
    }

    /// Resolves once the track's source has ended, whether by `stop` or
    /// externally.
    pub async fn ended(&self) {
        loop {
            let notified = self.ended_notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a notify between the
            // check and the await cannot be lost.
            notified.as_mut().enable();
            if self.ended.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Platform capture surface.
///
/// Capture methods take an optional device id; `None` selects the system
/// default. Implementations own permission prompts and OS capture APIs.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn enumerate(&self) -> Result<DeviceInventory, MediaError>;

    async fn capture_audio(&self, device: Option<&DeviceId>) -> Result<LocalTrack, MediaError>;

    async fn capture_video(&self, device: Option<&DeviceId>) -> Result<LocalTrack, MediaError>;

    /// Opens the platform screen picker and captures the chosen surface.
    async fn capture_screen(&self) -> Result<LocalTrack, MediaError>;
}
