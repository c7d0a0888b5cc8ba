//! Screen-share lifecycle: camera/screen track substitution.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::CallError;
use crate::negotiation::NegotiationEngine;
use crate::signal::ControlMessage;

use super::{DeviceId, MediaBackend, TrackKind};

/// Starts and stops sharing the local screen in place of camera video.
///
/// Sharing substitutes the screen track on the already-negotiated video
/// sender; no renegotiation happens. The camera device in use before the
/// share is remembered and restored when the share ends.
pub struct ScreenShareCoordinator {
    backend: Arc<dyn MediaBackend>,
    engine: Arc<NegotiationEngine>,
    inner: tokio::sync::Mutex<ShareInner>,
}

#[derive(Default)]
struct ShareInner {
    /// Camera to restore when the share ends; `None` when the call had no
    /// camera video at share start.
    prior_camera: Option<DeviceId>,
    /// Watches the screen track for an external end (picker dismissed).
    watcher: Option<JoinHandle<()>>,
}

impl ScreenShareCoordinator {
    pub fn new(backend: Arc<dyn MediaBackend>, engine: Arc<NegotiationEngine>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            engine,
            inner: tokio::sync::Mutex::new(ShareInner::default()),
        })
    }

    pub fn is_sharing(&self) -> bool {
        self.engine.screen_share_state().is_local_sharing
    }

    /// Captures the screen and swaps it onto the video sender.
    ///
    /// Refused while either side is already sharing. The remote check is
    /// advisory (it avoids two simultaneous shares in the common case);
    /// the protocol stays correct without it.
    pub async fn start_share(self: &Arc<Self>) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let share = self.engine.screen_share_state();
        if share.is_local_sharing {
            return Err(CallError::ShareRefused("already sharing"));
        }
        if share.is_remote_sharing {
            return Err(CallError::ShareRefused("peer is sharing"));
        }

        let screen = self.backend.capture_screen().await?;
        let old = self
            .engine
            .replace_outgoing_track(TrackKind::Video, screen.clone())
            .await
            .inspect_err(|_| screen.stop())?;
        inner.prior_camera = old.as_ref().and_then(|t| t.device_id().cloned());
        if let Some(old) = old {
            old.stop();
        }
        self.engine.set_local_sharing(true);
        if let Err(e) = self
            .engine
            .send_control(ControlMessage::UserStartedScreenShare)
            .await
        {
            log::warn!("could not announce screen share: {e}");
        }

        // The user can end capture from the OS picker without touching the
        // app; fold that path into the normal stop.
        let coordinator = Arc::downgrade(self);
        inner.watcher = Some(tokio::spawn(async move {
            screen.ended().await;
            let Some(coordinator) = coordinator.upgrade() else { return };
            if coordinator.is_sharing() {
                log::info!("screen capture ended externally, restoring camera");
                if let Err(e) = coordinator.stop_share().await {
                    log::warn!("restoring camera after external end failed: {e}");
                }
            }
        }));
        log::info!("screen share started");
        Ok(())
    }

    /// Ends the share and restores the prior camera (or leaves the video
    /// line silent when the camera cannot be reacquired). The stop
    /// announcement always goes out, camera or not.
    pub async fn stop_share(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if !self.engine.screen_share_state().is_local_sharing {
            return Ok(());
        }
        // Detach rather than abort: the external-end watcher may be the
        // task running this very function. It exits on its own once the
        // screen track stops below.
        drop(inner.watcher.take());
        let prior_camera = inner.prior_camera.take();
        self.engine.set_local_sharing(false);

        let restore = match self.backend.capture_video(prior_camera.as_ref()).await {
            Ok(camera) => {
                let old = self
                    .engine
                    .replace_outgoing_track(TrackKind::Video, camera)
                    .await?;
                if let Some(screen) = old {
                    screen.stop();
                }
                Ok(())
            }
            Err(e) => {
                log::warn!("camera restore failed after screen share: {e}");
                if let Ok(Some(screen)) = self.engine.clear_outgoing_track(TrackKind::Video).await {
                    screen.stop();
                }
                Err(CallError::Media(e))
            }
        };

        if let Err(e) = self
            .engine
            .send_control(ControlMessage::UserStoppedScreenShare)
            .await
        {
            log::warn!("could not announce screen share stop: {e}");
        }
        log::info!("screen share stopped");
        restore
    }
}
