//! In-process media backend for tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    DeviceDescriptor, DeviceId, DeviceInventory, LocalTrack, MediaBackend, MediaError, TrackKind,
};

/// Backend that hands out [`TrackLocalStaticSample`] tracks for a fixed
/// device inventory, with per-device failure injection.
pub struct StaticMediaBackend {
    inner: Mutex<State>,
}

struct State {
    inventory: DeviceInventory,
    failing: HashSet<DeviceId>,
    deny_media: bool,
    /// Tracks handed out so far, newest last.
    tracks: Vec<LocalTrack>,
    /// Live screen tracks, so a test can simulate the user ending the
    /// capture from the OS side.
    screen_tracks: Vec<LocalTrack>,
}

impl Default for StaticMediaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticMediaBackend {
    pub fn new() -> Self {
        let inventory = DeviceInventory {
            audio_inputs: vec![
                DeviceDescriptor::new("default-mic", "Built-in Microphone"),
                DeviceDescriptor::new("usb-mic", "USB Microphone"),
            ],
            video_inputs: vec![
                DeviceDescriptor::new("default-cam", "Built-in Camera"),
                DeviceDescriptor::new("usb-cam", "USB Camera"),
            ],
        };
        Self {
            inner: Mutex::new(State {
                inventory,
                failing: HashSet::new(),
                deny_media: false,
                tracks: Vec::new(),
                screen_tracks: Vec::new(),
            }),
        }
    }

    /// Makes every subsequent capture of `id` fail as busy.
    pub fn set_failing(&self, id: impl Into<DeviceId>) {
        self.lock().failing.insert(id.into());
    }

    pub fn clear_failing(&self, id: &DeviceId) {
        self.lock().failing.remove(id);
    }

    /// Makes every capture fail with a permission error.
    pub fn deny_media(&self, deny: bool) {
        self.lock().deny_media = deny;
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.lock().tracks.clone()
    }

    /// Simulates the user ending screen capture from the OS picker.
    pub fn end_screen_share(&self) {
        let tracks: Vec<LocalTrack> = self.lock().screen_tracks.drain(..).collect();
        for track in tracks {
            track.mark_ended();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn default_device(&self, kind: TrackKind) -> Result<DeviceDescriptor, MediaError> {
        self.lock()
            .inventory
            .inputs(kind)
            .first()
            .cloned()
            .ok_or_else(|| MediaError::DeviceNotFound(format!("no {kind} input present")))
    }

    fn resolve(
        &self,
        kind: TrackKind,
        device: Option<&DeviceId>,
    ) -> Result<DeviceDescriptor, MediaError> {
        let descriptor = match device {
            Some(id) => self
                .lock()
                .inventory
                .inputs(kind)
                .iter()
                .find(|d| &d.id == id)
                .cloned()
                .ok_or_else(|| MediaError::DeviceNotFound(id.to_string()))?,
            None => self.default_device(kind)?,
        };
        let state = self.lock();
        if state.deny_media {
            return Err(MediaError::PermissionDenied);
        }
        if state.failing.contains(&descriptor.id) {
            return Err(MediaError::DeviceBusy(descriptor.id.to_string()));
        }
        Ok(descriptor)
    }

    fn make_track(&self, kind: TrackKind, descriptor: DeviceDescriptor) -> LocalTrack {
        let (mime, stream) = match kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, "audio-stream"),
            TrackKind::Video => (MIME_TYPE_VP8, "video-stream"),
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            format!("{kind}-{}", descriptor.id),
            stream.to_owned(),
        ));
        let track = LocalTrack::new(kind, Some(descriptor.id), descriptor.label, rtc);
        self.lock().tracks.push(track.clone());
        track
    }
}

#[async_trait]
impl MediaBackend for StaticMediaBackend {
    async fn enumerate(&self) -> Result<DeviceInventory, MediaError> {
        Ok(self.lock().inventory.clone())
    }

    async fn capture_audio(&self, device: Option<&DeviceId>) -> Result<LocalTrack, MediaError> {
        let descriptor = self.resolve(TrackKind::Audio, device)?;
        Ok(self.make_track(TrackKind::Audio, descriptor))
    }

    async fn capture_video(&self, device: Option<&DeviceId>) -> Result<LocalTrack, MediaError> {
        let descriptor = self.resolve(TrackKind::Video, device)?;
        Ok(self.make_track(TrackKind::Video, descriptor))
    }

    async fn capture_screen(&self) -> Result<LocalTrack, MediaError> {
        if self.lock().deny_media {
            return Err(MediaError::PermissionDenied);
        }
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "screen".to_owned(),
            "screen-stream".to_owned(),
        ));
        let track = LocalTrack::new(TrackKind::Video, None, "Screen", rtc);
        let mut state = self.lock();
        state.tracks.push(track.clone());
        state.screen_tracks.push(track.clone());
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_prefers_named_device() {
        let backend = StaticMediaBackend::new();
        let track = backend
            .capture_video(Some(&DeviceId::from("usb-cam")))
            .await
            .unwrap();
        assert_eq!(track.device_id().unwrap().as_str(), "usb-cam");
    }

    #[tokio::test]
    async fn failing_device_reports_busy() {
        let backend = StaticMediaBackend::new();
        backend.set_failing("usb-cam");
        let err = backend
            .capture_video(Some(&DeviceId::from("usb-cam")))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::DeviceBusy(_)));
        // Default device still works.
        backend.capture_video(None).await.unwrap();
    }

    #[tokio::test]
    async fn ended_resolves_after_stop() {
        let backend = StaticMediaBackend::new();
        let track = backend.capture_audio(None).await.unwrap();
        track.stop();
        track.ended().await;
        assert!(track.is_stopped());
    }

    #[tokio::test]
    async fn screen_end_marks_track_ended() {
        let backend = StaticMediaBackend::new();
        let track = backend.capture_screen().await.unwrap();
        backend.end_screen_share();
        track.ended().await;
    }
}
