//! Live input-device switching.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::CallError;
use crate::negotiation::NegotiationEngine;

use super::{DeviceId, DeviceInventory, LocalTrack, MediaBackend, MediaError, TrackKind};

/// How a switch request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The requested device is now live.
    Switched,
    /// The requested device failed; the system default took its place.
    FellBackToDefault,
}

/// Switches capture devices under an active call without renegotiating.
///
/// A switch is capture-then-swap: the new device is acquired first, the
/// sender's track is replaced, and only then is the old capture released.
/// The call never goes silent mid-switch.
pub struct DeviceManager {
    backend: Arc<dyn MediaBackend>,
    engine: Arc<NegotiationEngine>,
    /// Kinds whose last switch burned through every fallback; cleared by
    /// the next successful switch.
    unavailable: Mutex<HashSet<TrackKind>>,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn MediaBackend>, engine: Arc<NegotiationEngine>) -> Self {
        Self {
            backend,
            engine,
            unavailable: Mutex::new(HashSet::new()),
        }
    }

    pub async fn enumerate(&self) -> Result<DeviceInventory, MediaError> {
        self.backend.enumerate().await
    }

    pub fn is_unavailable(&self, kind: TrackKind) -> bool {
        self.unavailable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&kind)
    }

    pub async fn switch_audio_input(&self, device: &DeviceId) -> Result<SwitchOutcome, CallError> {
        self.switch(TrackKind::Audio, device).await
    }

    /// Refused outright while a local screen share is live; the video
    /// sender belongs to the share until it ends.
    pub async fn switch_video_input(&self, device: &DeviceId) -> Result<SwitchOutcome, CallError> {
        if self.engine.screen_share_state().is_local_sharing {
            return Err(CallError::SwitchDuringShare);
        }
        self.switch(TrackKind::Video, device).await
    }

    async fn switch(&self, kind: TrackKind, device: &DeviceId) -> Result<SwitchOutcome, CallError> {
        match self.capture(kind, Some(device)).await {
            Ok(track) => {
                self.install(kind, track).await?;
                self.mark_available(kind);
                return Ok(SwitchOutcome::Switched);
            }
            Err(e) => {
                log::warn!("switch to {kind} device {device} failed: {e}, trying default");
            }
        }
        match self.capture(kind, None).await {
            Ok(track) => {
                self.install(kind, track).await?;
                self.mark_available(kind);
                Ok(SwitchOutcome::FellBackToDefault)
            }
            Err(e) => {
                log::error!("default {kind} device also failed: {e}");
                self.unavailable
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(kind);
                // Detach and release the old capture so the peer sees
                // silence instead of a frozen stale feed.
                if let Ok(Some(old)) = self.engine.clear_outgoing_track(kind).await {
                    old.stop();
                }
                Err(CallError::DeviceUnavailable(kind))
            }
        }
    }

    async fn capture(
        &self,
        kind: TrackKind,
        device: Option<&DeviceId>,
    ) -> Result<LocalTrack, MediaError> {
        match kind {
            TrackKind::Audio => self.backend.capture_audio(device).await,
            TrackKind::Video => self.backend.capture_video(device).await,
        }
    }

    async fn install(&self, kind: TrackKind, track: LocalTrack) -> Result<(), CallError> {
        let old = match self.engine.replace_outgoing_track(kind, track.clone()).await {
            Ok(old) => old,
            Err(e) => {
                track.stop();
                return Err(e);
            }
        };
        if let Some(old) = old {
            old.stop();
        }
        log::info!("switched {kind} input to {}", track.label());
        Ok(())
    }

    fn mark_available(&self, kind: TrackKind) {
        self.unavailable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&kind);
    }
}
