//! Offer/answer negotiation engine for one call session.
//!
//! One engine lives for at most one session. Setup is guarded
//! structurally: the session slot is a `Mutex<Option<..>>` and the slot
//! lock is held across the whole async setup, so a second `start` (or a
//! teardown racing setup) can never interleave with it. Once `teardown`
//! has run the engine is dead; recovery means a fresh engine on a fresh
//! call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{LocalTrack, MediaBackend, PreferredDevices, TrackKind};
use crate::relay::{RelayClient, RelayMessage};
use crate::signal::{ControlMessage, SignalPayload};
use crate::types::{CallRole, UserId};

/// Internal engine notifications, mapped onto public events by the
/// coordinator.
#[derive(Debug, Clone)]
pub(crate) enum EngineEvent {
    RemoteTrack { kind: TrackKind },
    RemoteScreenShare { sharing: bool },
    /// The session was abandoned through the reset protocol; the
    /// coordinator must hang up.
    Reset { notice: String },
    /// The transport died and the grace period expired.
    Fatal { notice: String },
}

/// Who is currently sending a screen capture instead of camera video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScreenShareState {
    pub is_local_sharing: bool,
    pub is_remote_sharing: bool,
}

/// One outgoing media line: the negotiated sender plus the track it is
/// currently carrying (if any).
struct TrackSlot {
    sender: Arc<RTCRtpSender>,
    track: Option<LocalTrack>,
}

/// Live per-call resources. Exists exactly while the session is up.
struct NegotiationSession {
    pc: Arc<RTCPeerConnection>,
    audio: TrackSlot,
    video: TrackSlot,
}

pub struct NegotiationEngine {
    peer: UserId,
    role: CallRole,
    config: CallConfig,
    relay: Arc<dyn RelayClient>,
    media: Arc<dyn MediaBackend>,
    events: mpsc::UnboundedSender<EngineEvent>,
    session: tokio::sync::Mutex<Option<NegotiationSession>>,
    /// ICE candidates that arrived before the remote description did.
    pending_ice: std::sync::Mutex<VecDeque<RTCIceCandidateInit>>,
    remote_described: AtomicBool,
    closed: AtomicBool,
    share: std::sync::Mutex<ScreenShareState>,
    /// Candidate strings in the order they were handed to the peer
    /// connection.
    #[cfg(test)]
    applied_ice: std::sync::Mutex<Vec<String>>,
}

impl NegotiationEngine {
    pub(crate) fn new(
        peer: UserId,
        role: CallRole,
        config: CallConfig,
        relay: Arc<dyn RelayClient>,
        media: Arc<dyn MediaBackend>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            peer,
            role,
            config,
            relay,
            media,
            events: tx,
            session: tokio::sync::Mutex::new(None),
            pending_ice: std::sync::Mutex::new(VecDeque::new()),
            remote_described: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            share: std::sync::Mutex::new(ScreenShareState::default()),
            #[cfg(test)]
            applied_ice: std::sync::Mutex::new(Vec::new()),
        });
        (engine, rx)
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Captures local media, builds the peer connection, and (for the
    /// caller) emits the initial offer.
    ///
    /// Holding the session lock for the whole setup makes concurrent
    /// starts collapse to one winner; losers see the occupied slot and
    /// return without side effects. Any failure releases everything
    /// acquired so far; a session is either fully up or gone.
    pub(crate) async fn start(
        self: &Arc<Self>,
        preferred: &PreferredDevices,
    ) -> Result<(), CallError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            log::warn!("duplicate session start for {} ignored", self.peer);
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::NotActive);
        }

        let audio = self.media.capture_audio(preferred.audio.as_ref()).await?;
        let video = match self.media.capture_video(preferred.video.as_ref()).await {
            Ok(track) => track,
            Err(e) => {
                audio.stop();
                return Err(e.into());
            }
        };

        let session = match self.establish(audio.clone(), video.clone()).await {
            Ok(session) => session,
            Err(e) => {
                audio.stop();
                video.stop();
                return Err(e);
            }
        };

        if self.closed.load(Ordering::SeqCst) {
            // Torn down while we were setting up; unwind instead of
            // publishing a session nothing will ever close.
            audio.stop();
            video.stop();
            let _ = session.pc.close().await;
            return Err(CallError::NotActive);
        }

        *slot = Some(session);
        log::info!("negotiation session up with {} as {:?}", self.peer, self.role);
        Ok(())
    }

    /// Builds the peer connection, attaches the tracks, and (for the
    /// caller) emits the initial offer. On error the connection is closed
    /// before returning; the caller releases the tracks.
    async fn establish(
        self: &Arc<Self>,
        audio: LocalTrack,
        video: LocalTrack,
    ) -> Result<NegotiationSession, CallError> {
        let pc = self.build_peer_connection().await?;
        self.register_handlers(&pc);

        let senders = async {
            let audio_sender = pc.add_track(audio.rtc_track()).await?;
            let video_sender = pc.add_track(video.rtc_track()).await?;
            if self.role == CallRole::Caller {
                let offer = pc.create_offer(None).await?;
                pc.set_local_description(offer.clone()).await?;
                self.send_signal(SignalPayload::Offer { sdp: offer }).await?;
            }
            Ok::<_, CallError>((audio_sender, video_sender))
        }
        .await;

        match senders {
            Ok((audio_sender, video_sender)) => Ok(NegotiationSession {
                pc,
                audio: TrackSlot {
                    sender: audio_sender,
                    track: Some(audio),
                },
                video: TrackSlot {
                    sender: video_sender,
                    track: Some(video),
                },
            }),
            Err(e) => {
                let _ = pc.close().await;
                Err(e)
            }
        }
    }

    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        Ok(Arc::new(api.new_peer_connection(rtc_config).await?))
    }

    fn register_handlers(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>) {
        let weak = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Some(engine) = weak.upgrade() else { return };
                if engine.closed.load(Ordering::SeqCst) {
                    return;
                }
                match candidate.to_json() {
                    Ok(init) => {
                        if let Err(e) = engine
                            .send_signal(SignalPayload::Ice { candidate: init })
                            .await
                        {
                            log::warn!("failed to trickle ICE candidate: {e}");
                        }
                    }
                    Err(e) => log::warn!("failed to serialize ICE candidate: {e}"),
                }
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(engine) = weak.upgrade() else { return };
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                log::info!("remote {kind} track from {}", engine.peer);
                engine.emit(EngineEvent::RemoteTrack { kind });
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(engine) = weak.upgrade() else { return };
                log::debug!("ICE connection state with {}: {state}", engine.peer);
                if matches!(
                    state,
                    RTCIceConnectionState::Disconnected
                        | RTCIceConnectionState::Failed
                        | RTCIceConnectionState::Closed
                ) {
                    tokio::spawn(async move { engine.on_transport_lost().await });
                }
            })
        }));
    }

    /// ICE transport loss is unrecoverable for this engine: tell the peer
    /// to abandon too, wait out the grace window, then report the death.
    async fn on_transport_lost(self: Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        log::warn!("ICE transport to {} lost, abandoning session", self.peer);
        if let Err(e) = self.send_control(ControlMessage::Reset).await {
            log::debug!("could not notify {} of transport loss: {e}", self.peer);
        }
        tokio::time::sleep(self.config.ice_disconnect_grace).await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.emit(EngineEvent::Fatal {
            notice: format!("media transport to {} lost", self.peer),
        });
    }

    /// Dispatches one signal delivered by the relay.
    pub async fn handle_signal(self: &Arc<Self>, signal: SignalPayload) -> Result<(), CallError> {
        if self.closed.load(Ordering::SeqCst) {
            log::debug!("dropping {} signal after teardown", signal.kind());
            return Ok(());
        }
        match signal {
            SignalPayload::Offer { sdp } => self.on_offer(sdp).await,
            SignalPayload::Answer { sdp } => self.on_answer(sdp).await,
            SignalPayload::Ice { candidate } => self.on_ice(candidate).await,
            SignalPayload::Control { message } => self.on_control(message).await,
        }
    }

    async fn on_offer(self: &Arc<Self>, sdp: RTCSessionDescription) -> Result<(), CallError> {
        let slot = self.session.lock().await;
        let Some(session) = slot.as_ref() else {
            log::debug!("offer from {} with no session, dropped", self.peer);
            return Ok(());
        };
        if session.pc.signaling_state() != RTCSignalingState::Stable {
            drop(slot);
            return self.abandon_on_conflict("offer").await;
        }
        session.pc.set_remote_description(sdp).await?;
        let answer = session.pc.create_answer(None).await?;
        session.pc.set_local_description(answer.clone()).await?;
        self.send_signal(SignalPayload::Answer { sdp: answer })
            .await?;
        self.remote_described.store(true, Ordering::SeqCst);
        self.drain_pending_ice(&session.pc).await;
        Ok(())
    }

    async fn on_answer(self: &Arc<Self>, sdp: RTCSessionDescription) -> Result<(), CallError> {
        let slot = self.session.lock().await;
        let Some(session) = slot.as_ref() else {
            log::debug!("answer from {} with no session, dropped", self.peer);
            return Ok(());
        };
        if session.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            drop(slot);
            return self.abandon_on_conflict("answer").await;
        }
        if let Err(e) = session.pc.set_remote_description(sdp).await {
            log::warn!("rejecting unusable answer from {}: {e}", self.peer);
            drop(slot);
            return self.abandon_on_conflict("answer").await;
        }
        self.remote_described.store(true, Ordering::SeqCst);
        self.drain_pending_ice(&session.pc).await;
        Ok(())
    }

    /// A signal arrived in a state we cannot apply it from (signaling
    /// glare, stale answer). Resuming is never attempted: both sides
    /// abandon and the users redial.
    async fn abandon_on_conflict(self: &Arc<Self>, kind: &str) -> Result<(), CallError> {
        log::warn!(
            "unexpected {kind} from {} in state {:?}, abandoning session",
            self.peer,
            self.role
        );
        if let Err(e) = self.send_control(ControlMessage::Reset).await {
            log::debug!("could not send reset to {}: {e}", self.peer);
        }
        self.emit(EngineEvent::Reset {
            notice: format!("negotiation conflict on {kind}"),
        });
        Ok(())
    }

    async fn on_ice(self: &Arc<Self>, candidate: RTCIceCandidateInit) -> Result<(), CallError> {
        if !self.remote_described.load(Ordering::SeqCst) {
            let mut pending = self.pending_ice.lock().unwrap_or_else(|e| e.into_inner());
            if pending.len() >= self.config.pending_ice_limit {
                log::warn!(
                    "pending ICE queue for {} full ({}), dropping oldest",
                    self.peer,
                    pending.len()
                );
                pending.pop_front();
            }
            pending.push_back(candidate);
            return Ok(());
        }
        let slot = self.session.lock().await;
        let Some(session) = slot.as_ref() else {
            return Ok(());
        };
        self.record_applied_ice(&candidate);
        session.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// Applies buffered candidates in arrival order. Individual failures
    /// are logged and skipped; ICE tolerates missing candidates.
    async fn drain_pending_ice(&self, pc: &Arc<RTCPeerConnection>) {
        let drained: Vec<RTCIceCandidateInit> = {
            let mut pending = self.pending_ice.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        log::debug!("applying {} buffered ICE candidates", drained.len());
        for candidate in drained {
            self.record_applied_ice(&candidate);
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                log::warn!("buffered ICE candidate rejected: {e}");
            }
        }
    }

    #[cfg(test)]
    fn record_applied_ice(&self, candidate: &RTCIceCandidateInit) {
        self.applied_ice
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(candidate.candidate.clone());
    }

    #[cfg(not(test))]
    fn record_applied_ice(&self, _candidate: &RTCIceCandidateInit) {}

    async fn on_control(self: &Arc<Self>, message: ControlMessage) -> Result<(), CallError> {
        match message {
            ControlMessage::Reset => {
                log::warn!("peer {} reset the session", self.peer);
                self.teardown().await;
                self.emit(EngineEvent::Reset {
                    notice: format!("session reset by {}", self.peer),
                });
            }
            ControlMessage::UserStartedScreenShare | ControlMessage::UserStoppedScreenShare => {
                let sharing = message == ControlMessage::UserStartedScreenShare;
                {
                    let mut share = self.share.lock().unwrap_or_else(|e| e.into_inner());
                    share.is_remote_sharing = sharing;
                }
                self.emit(EngineEvent::RemoteScreenShare { sharing });
            }
        }
        Ok(())
    }

    /// Swaps the outgoing track of `kind` without renegotiating. Returns
    /// the displaced track; the caller decides when to stop it.
    pub async fn replace_outgoing_track(
        &self,
        kind: TrackKind,
        new: LocalTrack,
    ) -> Result<Option<LocalTrack>, CallError> {
        let mut slot = self.session.lock().await;
        let session = slot.as_mut().ok_or(CallError::NotActive)?;
        let line = match kind {
            TrackKind::Audio => &mut session.audio,
            TrackKind::Video => &mut session.video,
        };
        line.sender.replace_track(Some(new.rtc_track())).await?;
        Ok(line.track.replace(new))
    }

    /// Detaches the outgoing track of `kind`, leaving the media line
    /// negotiated but silent.
    pub async fn clear_outgoing_track(
        &self,
        kind: TrackKind,
    ) -> Result<Option<LocalTrack>, CallError> {
        let mut slot = self.session.lock().await;
        let session = slot.as_mut().ok_or(CallError::NotActive)?;
        let line = match kind {
            TrackKind::Audio => &mut session.audio,
            TrackKind::Video => &mut session.video,
        };
        line.sender.replace_track(None).await?;
        Ok(line.track.take())
    }

    /// Mute/unmute the outgoing track of `kind` without releasing its
    /// capture source.
    pub async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), CallError> {
        let slot = self.session.lock().await;
        let session = slot.as_ref().ok_or(CallError::NotActive)?;
        let line = match kind {
            TrackKind::Audio => &session.audio,
            TrackKind::Video => &session.video,
        };
        match &line.track {
            Some(track) => {
                track.set_enabled(enabled);
                Ok(())
            }
            None => Err(CallError::DeviceUnavailable(kind)),
        }
    }

    pub async fn outgoing_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        let slot = self.session.lock().await;
        let session = slot.as_ref()?;
        match kind {
            TrackKind::Audio => session.audio.track.clone(),
            TrackKind::Video => session.video.track.clone(),
        }
    }

    pub fn screen_share_state(&self) -> ScreenShareState {
        *self.share.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_local_sharing(&self, sharing: bool) {
        self.share
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_local_sharing = sharing;
    }

    pub(crate) async fn send_control(&self, message: ControlMessage) -> Result<(), CallError> {
        log::debug!("sending control:{} to {}", message.tag_name(), self.peer);
        self.send_signal(SignalPayload::Control { message }).await
    }

    async fn send_signal(&self, signal: SignalPayload) -> Result<(), CallError> {
        self.relay
            .send(&self.peer, RelayMessage::SendingSignal { signal })
            .await?;
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        // The receiver disappears when the coordinator drops the engine;
        // nothing to do then.
        let _ = self.events.send(event);
    }

    /// Releases every session resource. Idempotent; the first caller wins
    /// and later calls are no-ops.
    pub(crate) async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            // Replace the handlers before closing so no late callback
            // runs against a half-dead engine.
            session.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
            session
                .pc
                .on_track(Box::new(|_, _, _| Box::pin(async {})));
            session
                .pc
                .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
            if let Some(track) = &session.audio.track {
                track.stop();
            }
            if let Some(track) = &session.video.track {
                track.stop();
            }
            if let Err(e) = session.pc.close().await {
                log::warn!("error closing peer connection to {}: {e}", self.peer);
            }
        }
        self.pending_ice
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.remote_described.store(false, Ordering::SeqCst);
        *self.share.lock().unwrap_or_else(|e| e.into_inner()) = ScreenShareState::default();
        log::info!("negotiation session with {} torn down", self.peer);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn pending_ice_len(&self) -> usize {
        self.pending_ice
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    #[cfg(test)]
    pub(crate) async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    #[cfg(test)]
    pub(crate) fn applied_ice(&self) -> Vec<String> {
        self.applied_ice
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
