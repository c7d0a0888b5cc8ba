//! Call-related error types.

use thiserror::Error;

use crate::media::{MediaError, TrackKind};
use crate::relay::RelayError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call already in progress: {0}")]
    CallInProgress(String),

    #[error("call refused: cooldown active")]
    Cooldown,

    #[error("no active negotiation session")]
    NotActive,

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("negotiation error: {0}")]
    Negotiation(#[from] webrtc::Error),

    #[error("screen share refused: {0}")]
    ShareRefused(&'static str),

    #[error("device switch refused while screen sharing")]
    SwitchDuringShare,

    #[error("{0} input unavailable")]
    DeviceUnavailable(TrackKind),
}
