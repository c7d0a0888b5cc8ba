//! Configuration for the call engine.

use std::time::Duration;

use crate::media::PreferredDevices;

/// Tunables for one [`CallSessionCoordinator`] and the negotiation engines
/// it spawns.
///
/// [`CallSessionCoordinator`]: crate::coordinator::CallSessionCoordinator
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Re-dial lockout started on every terminal transition.
    pub cooldown: Duration,
    /// How long an incoming call rings before it is auto-rejected.
    pub ring_timeout: Duration,
    /// Delay between emitting `control:reset` on ICE transport loss and
    /// forcing the local hangup.
    pub ice_disconnect_grace: Duration,
    /// ICE server URLs handed to every peer connection.
    pub ice_servers: Vec<String>,
    /// Cap on buffered out-of-order ICE candidates; the oldest entry is
    /// dropped (with a warning) on overflow.
    pub pending_ice_limit: usize,
    /// Capture devices to prefer during session setup; system defaults
    /// when unset.
    pub preferred_devices: PreferredDevices,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(2),
            ring_timeout: Duration::from_secs(60),
            ice_disconnect_grace: Duration::from_secs(1),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            pending_ice_limit: 256,
            preferred_devices: PreferredDevices::default(),
        }
    }
}
