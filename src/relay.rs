//! Relay client seam.
//!
//! The relay is a server-mediated, user-id-addressed channel. It delivers
//! messages at-least-once to online peers, preserving per-sender order but
//! giving no cross-sender ordering guarantee. The engine compensates with
//! explicit signaling-state guards instead of assuming arrival order.
//!
//! The handle is injected into [`CallSessionCoordinator`] and the
//! negotiation engine; there is no ambient/global connection object.
//!
//! [`CallSessionCoordinator`]: crate::coordinator::CallSessionCoordinator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signal::SignalPayload;
use crate::types::UserId;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay send failed: {0}")]
    Send(String),

    #[error("relay peer not reachable: {0}")]
    Unreachable(UserId),

    #[error("relay connection closed")]
    Closed,
}

/// Outbound messages, addressed to one peer by user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RelayMessage {
    /// Dial the target; delivered as `incomingCall`.
    CallUser { from: UserId },
    /// Accept an incoming call, echoing the opaque signal blob from the
    /// offer; delivered as `callAccepted`.
    AnswerCall {
        signal: serde_json::Value,
        from: UserId,
    },
    /// Decline an incoming call; delivered as `callRejected`.
    RejectCall,
    /// End or cancel a call; delivered as `callEnded`.
    HangUp,
    /// Forward one negotiation signal; delivered as `returningSignal`.
    SendingSignal { signal: SignalPayload },
}

/// Inbound events as the relay delivers them to this client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RelayEvent {
    IncomingCall {
        from: UserId,
        signal: serde_json::Value,
    },
    CallAccepted {
        signal: serde_json::Value,
    },
    CallRejected,
    CallEnded,
    ReturningSignal {
        signal: SignalPayload,
    },
}

/// Per-user bidirectional relay channel.
///
/// Implementations wrap whatever transport reaches the relay server; tests
/// use the in-process [`RelayHub`](crate::test_relay::RelayHub).
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn send(&self, to: &UserId, message: RelayMessage) -> Result<(), RelayError>;
}
