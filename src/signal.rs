//! Negotiation signal payloads carried through the relay.
//!
//! Every payload rides a `sendingSignal` relay message and is delivered to
//! the peer as `returningSignal`. SDP and ICE bodies are passed opaquely;
//! control messages are the only application-level signals.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Out-of-band control messages (not SDP/ICE) coordinating screen-share
/// state or session recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlMessage {
    /// The peer swapped its outgoing video for a screen capture.
    UserStartedScreenShare,
    /// The peer restored (or dropped) its camera video.
    UserStoppedScreenShare,
    /// Abandon the session: the recipient must unconditionally tear down
    /// and hang up, never resume.
    Reset,
}

impl ControlMessage {
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::UserStartedScreenShare => "userStartedScreenShare",
            Self::UserStoppedScreenShare => "userStoppedScreenShare",
            Self::Reset => "reset",
        }
    }
}

/// A single negotiation signal exchanged between the two peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalPayload {
    /// Caller's session description.
    Offer { sdp: RTCSessionDescription },
    /// Callee's session description.
    Answer { sdp: RTCSessionDescription },
    /// One trickled ICE candidate.
    Ice { candidate: RTCIceCandidateInit },
    /// Out-of-band control signal.
    Control { message: ControlMessage },
}

impl SignalPayload {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Ice { .. } => "ice",
            Self::Control { .. } => "control",
        }
    }
}
