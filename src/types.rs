//! Call lifecycle types: user ids, roles, the four-state machine, call intents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relay-level user identifier. The relay addresses every message by one of
/// these; the engine never inspects its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which side of the offer/answer exchange this client drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallRole {
    /// We dialed: we create the offer once the callee accepts.
    Caller,
    /// We answered: we wait for the caller's offer.
    Callee,
}

/// Current state of the local call lifecycle. Exactly one per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CallState {
    /// No call in progress.
    #[default]
    Idle,
    /// Outgoing call: waiting for the callee to accept or reject.
    Calling,
    /// Incoming call: ringing locally, waiting for a local decision.
    Incoming,
    /// Call accepted by both sides; a negotiation session is live.
    Active,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// A new outgoing call may only start from Idle.
    pub fn can_initiate(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Incoming)
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::Incoming)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Incoming => "incoming",
            Self::Active => "active",
        };
        f.write_str(name)
    }
}

/// One outgoing or incoming call attempt. Created when leaving Idle,
/// destroyed on the way back. At most one exists per user at any time.
#[derive(Debug, Clone, Serialize)]
pub struct CallIntent {
    /// The other participant.
    pub peer: UserId,
    /// Our side of the exchange.
    pub role: CallRole,
    pub started_at: DateTime<Utc>,
}

impl CallIntent {
    pub fn caller(peer: UserId) -> Self {
        Self {
            peer,
            role: CallRole::Caller,
            started_at: Utc::now(),
        }
    }

    pub fn callee(peer: UserId) -> Self {
        Self {
            peer,
            role: CallRole::Callee,
            started_at: Utc::now(),
        }
    }

    pub fn is_caller(&self) -> bool {
        self.role == CallRole::Caller
    }
}
