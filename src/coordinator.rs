//! Call lifecycle state machine.
//!
//! The coordinator owns the `Idle -> Calling/Incoming -> Active -> Idle`
//! machine, the ring timer, and the redial cooldown. All media and
//! negotiation work is delegated to a per-call [`NegotiationEngine`];
//! the coordinator creates one when a call goes active and tears it down
//! on every terminal transition.
//!
//! Local teardown always precedes the outgoing hangup notification, so a
//! relay failure can never leave the local side stuck in a dead call.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CallConfig;
use crate::error::CallError;
use crate::events::CallEvent;
use crate::media::{DeviceManager, MediaBackend, ScreenShareCoordinator};
use crate::negotiation::{EngineEvent, NegotiationEngine};
use crate::relay::{RelayClient, RelayEvent, RelayMessage};
use crate::types::{CallIntent, CallRole, CallState, UserId};

struct Inner {
    state: CallState,
    intent: Option<CallIntent>,
    /// Opaque blob from the incoming-call notification, echoed back on
    /// accept.
    offer_signal: Option<serde_json::Value>,
    engine: Option<Arc<NegotiationEngine>>,
    /// Per-call surfaces; they carry call-scoped bookkeeping (unavailable
    /// device kinds, the camera to restore after a share), so exactly one
    /// of each exists per call.
    devices: Option<Arc<DeviceManager>>,
    share: Option<Arc<ScreenShareCoordinator>>,
    ring_timer: Option<JoinHandle<()>>,
    cooldown_until: Option<Instant>,
}

pub struct CallSessionCoordinator {
    self_id: UserId,
    config: CallConfig,
    relay: Arc<dyn RelayClient>,
    media: Arc<dyn MediaBackend>,
    events: mpsc::UnboundedSender<CallEvent>,
    inner: tokio::sync::Mutex<Inner>,
}

impl CallSessionCoordinator {
    pub fn new(
        self_id: UserId,
        config: CallConfig,
        relay: Arc<dyn RelayClient>,
        media: Arc<dyn MediaBackend>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            self_id,
            config,
            relay,
            media,
            events: tx,
            inner: tokio::sync::Mutex::new(Inner {
                state: CallState::Idle,
                intent: None,
                offer_signal: None,
                engine: None,
                devices: None,
                share: None,
                ring_timer: None,
                cooldown_until: None,
            }),
        });
        (coordinator, rx)
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub async fn state(&self) -> CallState {
        self.inner.lock().await.state
    }

    pub async fn intent(&self) -> Option<CallIntent> {
        self.inner.lock().await.intent.clone()
    }

    pub async fn active_engine(&self) -> Option<Arc<NegotiationEngine>> {
        self.inner.lock().await.engine.clone()
    }

    /// Device switching surface for the current call, if one is active.
    /// Every fetch returns the same per-call instance.
    pub async fn device_manager(&self) -> Option<Arc<DeviceManager>> {
        self.inner.lock().await.devices.clone()
    }

    /// Screen-share surface for the current call, if one is active.
    /// Every fetch returns the same per-call instance.
    pub async fn screen_share(&self) -> Option<Arc<ScreenShareCoordinator>> {
        self.inner.lock().await.share.clone()
    }

    /// Spawns a pump feeding relay deliveries into the coordinator.
    pub fn attach_relay_events(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<RelayEvent>,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                coordinator.handle_relay_event(event).await;
            }
        })
    }

    /// Dials `peer`. Refused outside `Idle` and during the post-call
    /// cooldown window.
    pub async fn initiate_call(&self, peer: UserId) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if !inner.state.can_initiate() {
            return Err(CallError::CallInProgress(inner.state.to_string()));
        }
        if let Some(until) = inner.cooldown_until
            && Instant::now() < until
        {
            return Err(CallError::Cooldown);
        }
        self.relay
            .send(
                &peer,
                RelayMessage::CallUser {
                    from: self.self_id.clone(),
                },
            )
            .await?;
        inner.intent = Some(CallIntent::caller(peer));
        self.set_state(&mut inner, CallState::Calling);
        Ok(())
    }

    /// Accepts the ringing call. A no-op outside `Incoming`.
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if !inner.state.can_accept() {
            log::debug!("accept_call in {} ignored", inner.state);
            return Ok(());
        }
        if let Some(timer) = inner.ring_timer.take() {
            timer.abort();
        }
        let Some(peer) = inner.intent.as_ref().map(|i| i.peer.clone()) else {
            return Err(CallError::NotActive);
        };
        let signal = inner.offer_signal.take().unwrap_or(serde_json::Value::Null);
        self.relay
            .send(
                &peer,
                RelayMessage::AnswerCall {
                    signal,
                    from: self.self_id.clone(),
                },
            )
            .await?;
        self.set_state(&mut inner, CallState::Active);
        self.start_engine(&mut inner, peer, CallRole::Callee).await;
        Ok(())
    }

    /// Declines the ringing call. A no-op outside `Incoming`.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if !inner.state.can_reject() {
            log::debug!("reject_call in {} ignored", inner.state);
            return Ok(());
        }
        let peer = inner.intent.as_ref().map(|i| i.peer.clone());
        self.finish_call(&mut inner).await;
        drop(inner);
        if let Some(peer) = peer {
            self.relay.send(&peer, RelayMessage::RejectCall).await?;
        }
        Ok(())
    }

    /// Cancels an outgoing call that has not been answered yet.
    pub async fn cancel_call(&self) -> Result<(), CallError> {
        if self.state().await != CallState::Calling {
            log::debug!("cancel_call outside Calling ignored");
            return Ok(());
        }
        self.hang_up().await
    }

    /// Ends the current call (or cancels an unanswered outgoing one).
    ///
    /// Local teardown happens first; the relay notification failing does
    /// not undo it.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, CallState::Calling | CallState::Active) {
            log::debug!("hang_up in {} ignored", inner.state);
            return Ok(());
        }
        let peer = inner.intent.as_ref().map(|i| i.peer.clone());
        self.finish_call(&mut inner).await;
        drop(inner);
        if let Some(peer) = peer
            && let Err(e) = self.relay.send(&peer, RelayMessage::HangUp).await
        {
            log::warn!("hangup notification to {peer} failed: {e}");
        }
        Ok(())
    }

    /// Feeds one relay delivery through the state machine.
    pub async fn handle_relay_event(self: &Arc<Self>, event: RelayEvent) {
        match event {
            RelayEvent::IncomingCall { from, signal } => self.on_incoming_call(from, signal).await,
            RelayEvent::CallAccepted { .. } => self.on_call_accepted().await,
            RelayEvent::CallRejected => {
                let mut inner = self.inner.lock().await;
                if inner.state == CallState::Calling {
                    log::info!("call rejected by peer");
                    self.finish_call(&mut inner).await;
                }
            }
            RelayEvent::CallEnded => {
                let mut inner = self.inner.lock().await;
                if !inner.state.is_idle() {
                    log::info!("call ended by peer");
                    self.finish_call(&mut inner).await;
                }
            }
            RelayEvent::ReturningSignal { signal } => {
                let engine = self.active_engine().await;
                match engine {
                    Some(engine) => {
                        if let Err(e) = engine.handle_signal(signal).await {
                            log::warn!("signal handling failed: {e}");
                            self.emit(CallEvent::Error {
                                message: format!("signal handling failed: {e}"),
                            });
                        }
                    }
                    None => log::debug!("signal with no active session, dropped"),
                }
            }
        }
    }

    async fn on_incoming_call(self: &Arc<Self>, from: UserId, signal: serde_json::Value) {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_idle() {
            // Busy. The caller gives up via its own ring timeout.
            log::info!("ignoring incoming call from {from} while {}", inner.state);
            return;
        }
        inner.intent = Some(CallIntent::callee(from.clone()));
        inner.offer_signal = Some(signal);
        self.set_state(&mut inner, CallState::Incoming);
        self.emit(CallEvent::IncomingCall { from });

        let coordinator = self.clone();
        let ring_timeout = self.config.ring_timeout;
        inner.ring_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            coordinator.on_ring_timeout().await;
        }));
    }

    async fn on_call_accepted(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.state != CallState::Calling {
            log::debug!("callAccepted in {} ignored", inner.state);
            return;
        }
        let Some(peer) = inner.intent.as_ref().map(|i| i.peer.clone()) else {
            return;
        };
        self.set_state(&mut inner, CallState::Active);
        self.start_engine(&mut inner, peer, CallRole::Caller).await;
    }

    async fn on_ring_timeout(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.state != CallState::Incoming {
            return;
        }
        log::info!("incoming call timed out unanswered");
        // This runs on the timer task itself; clear the handle instead of
        // aborting it.
        inner.ring_timer = None;
        let peer = inner.intent.as_ref().map(|i| i.peer.clone());
        self.finish_call(&mut inner).await;
        drop(inner);
        if let Some(peer) = peer
            && let Err(e) = self.relay.send(&peer, RelayMessage::RejectCall).await
        {
            log::warn!("timeout rejection to {peer} failed: {e}");
        }
    }

    /// Creates the per-call engine, runs session setup to completion, and
    /// wires engine events back into the public channel.
    ///
    /// Setup is awaited inline so the session exists before any later
    /// relay delivery (the peer's offer in particular) is processed.
    async fn start_engine(self: &Arc<Self>, inner: &mut Inner, peer: UserId, role: CallRole) {
        let (engine, mut engine_rx) = NegotiationEngine::new(
            peer.clone(),
            role,
            self.config.clone(),
            self.relay.clone(),
            self.media.clone(),
        );
        inner.engine = Some(engine.clone());

        if let Err(e) = engine.start(&self.config.preferred_devices).await {
            log::error!("session setup failed: {e}");
            self.emit(CallEvent::Error {
                message: format!("session setup failed: {e}"),
            });
            self.finish_call(inner).await;
            if let Err(e) = self.relay.send(&peer, RelayMessage::HangUp).await {
                log::warn!("hangup after failed setup: {e}");
            }
            return;
        }

        inner.devices = Some(Arc::new(DeviceManager::new(
            self.media.clone(),
            engine.clone(),
        )));
        inner.share = Some(ScreenShareCoordinator::new(self.media.clone(), engine));

        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = engine_rx.recv().await {
                match event {
                    EngineEvent::RemoteTrack { kind } => {
                        coordinator.emit(CallEvent::RemoteTrackAdded { kind });
                    }
                    EngineEvent::RemoteScreenShare { sharing } => {
                        coordinator.emit(CallEvent::RemoteScreenShareChanged { sharing });
                    }
                    EngineEvent::Reset { notice } => {
                        coordinator.emit(CallEvent::CallReset { message: notice });
                        if let Err(e) = coordinator.hang_up().await {
                            log::warn!("hangup after reset: {e}");
                        }
                    }
                    EngineEvent::Fatal { notice } => {
                        coordinator.emit(CallEvent::Error { message: notice });
                        if let Err(e) = coordinator.hang_up().await {
                            log::warn!("hangup after transport loss: {e}");
                        }
                    }
                }
            }
        });
    }

    /// Terminal transition: tears the session down, clears call context,
    /// starts the redial cooldown, and lands in `Idle`.
    async fn finish_call(&self, inner: &mut Inner) {
        if let Some(timer) = inner.ring_timer.take() {
            timer.abort();
        }
        if let Some(engine) = inner.engine.take() {
            engine.teardown().await;
        }
        inner.devices = None;
        inner.share = None;
        inner.intent = None;
        inner.offer_signal = None;
        inner.cooldown_until = Some(Instant::now() + self.config.cooldown);
        self.set_state(inner, CallState::Idle);
    }

    fn set_state(&self, inner: &mut Inner, state: CallState) {
        if inner.state == state {
            return;
        }
        log::info!("call state: {} -> {state}", inner.state);
        inner.state = state;
        self.emit(CallEvent::StateChanged { state });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}
