//! Two-party call signaling and media negotiation over a user-addressed
//! relay.
//!
//! # Architecture
//!
//! - [`coordinator::CallSessionCoordinator`]: call lifecycle state machine
//!   (dial, ring, accept/reject, hang up, cooldown)
//! - [`negotiation::NegotiationEngine`]: per-call offer/answer, trickle
//!   ICE, and the reset recovery protocol
//! - [`media`]: capture backends, device switching, screen share
//! - [`relay`]: the injected transport seam to the signaling server
//! - [`test_relay::RelayHub`]: in-process relay for tests

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod relay;
pub mod signal;
pub mod test_relay;
pub mod types;

pub use config::CallConfig;
pub use coordinator::CallSessionCoordinator;
pub use error::CallError;
pub use events::CallEvent;
pub use media::{
    DeviceId, DeviceManager, LocalTrack, MediaBackend, PreferredDevices, ScreenShareCoordinator,
    SwitchOutcome, TrackKind,
};
pub use negotiation::{NegotiationEngine, ScreenShareState};
pub use relay::{RelayClient, RelayError, RelayEvent, RelayMessage};
pub use signal::{ControlMessage, SignalPayload};
pub use types::{CallIntent, CallRole, CallState, UserId};
