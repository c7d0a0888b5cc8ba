//! Events surfaced to the embedding application.

use crate::media::TrackKind;
use crate::types::{CallState, UserId};

/// Notifications the coordinator pushes to the UI layer.
///
/// Delivered over the unbounded channel returned by
/// [`CallSessionCoordinator::new`]; the application decides how to render
/// them (ring screen, error banner, remote video element, ...).
///
/// [`CallSessionCoordinator::new`]: crate::coordinator::CallSessionCoordinator::new
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The lifecycle state machine moved.
    StateChanged { state: CallState },
    /// A call is ringing locally.
    IncomingCall { from: UserId },
    /// The peer connection exposed a remote media track.
    RemoteTrackAdded { kind: TrackKind },
    /// The peer announced a screen-share start/stop.
    RemoteScreenShareChanged { sharing: bool },
    /// The session was abandoned through the reset protocol.
    CallReset { message: String },
    /// A failure the operator should see; no automatic transition is
    /// attached to it.
    Error { message: String },
}
