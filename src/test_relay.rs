//! In-process relay for tests.
//!
//! [`RelayHub`] plays the relay server: registered users get a
//! [`RelayClient`] handle plus a delivery stream, and every send is
//! translated to the event the real relay would deliver to the target.
//! All traffic is logged for assertions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::relay::{RelayClient, RelayError, RelayEvent, RelayMessage};
use crate::types::UserId;

#[derive(Default)]
struct HubState {
    peers: HashMap<UserId, mpsc::UnboundedSender<RelayEvent>>,
    log: Vec<(UserId, UserId, RelayMessage)>,
}

#[derive(Default)]
pub struct RelayHub {
    state: Arc<Mutex<HubState>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `user` to the hub, returning its sending handle and the
    /// stream of events delivered to it.
    pub fn register(
        &self,
        user: UserId,
    ) -> (Arc<HubClient>, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.peers.insert(user.clone(), tx);
        let client = Arc::new(HubClient {
            from: user,
            state: self.state.clone(),
        });
        (client, rx)
    }

    /// Simulates `user` going offline.
    pub fn disconnect(&self, user: &UserId) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .remove(user);
    }

    /// Every message addressed to `user`, in send order.
    pub fn sent_to(&self, user: &UserId) -> Vec<RelayMessage> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .log
            .iter()
            .filter(|(_, to, _)| to == user)
            .map(|(_, _, m)| m.clone())
            .collect()
    }

    /// Full traffic log as `(from, to, message)` triples.
    pub fn messages(&self) -> Vec<(UserId, UserId, RelayMessage)> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .log
            .clone()
    }
}

/// One user's connection to the hub.
pub struct HubClient {
    from: UserId,
    state: Arc<Mutex<HubState>>,
}

#[async_trait]
impl RelayClient for HubClient {
    async fn send(&self, to: &UserId, message: RelayMessage) -> Result<(), RelayError> {
        log::debug!("relay {} -> {to}: {message:?}", self.from);
        let event = match &message {
            RelayMessage::CallUser { from } => RelayEvent::IncomingCall {
                from: from.clone(),
                signal: serde_json::Value::Null,
            },
            RelayMessage::AnswerCall { signal, .. } => RelayEvent::CallAccepted {
                signal: signal.clone(),
            },
            RelayMessage::RejectCall => RelayEvent::CallRejected,
            RelayMessage::HangUp => RelayEvent::CallEnded,
            RelayMessage::SendingSignal { signal } => RelayEvent::ReturningSignal {
                signal: signal.clone(),
            },
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .log
            .push((self.from.clone(), to.clone(), message));
        let Some(tx) = state.peers.get(to) else {
            return Err(RelayError::Unreachable(to.clone()));
        };
        tx.send(event).map_err(|_| RelayError::Closed)
    }
}
