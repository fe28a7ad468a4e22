//! Address book entries and the retrieval eligibility filter.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// A candidate address and its connection history.
///
/// Timestamps are `None` until the event first happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub address: SocketAddr,
    /// Number of times the address was announced to us.
    pub num_seen: u64,
    /// Attempts since the last success.
    pub num_attempts: u64,
    pub last_seen: Option<SystemTime>,
    pub last_attempted: Option<SystemTime>,
    pub last_connected: Option<SystemTime>,
    pub last_succeeded: Option<SystemTime>,
}

impl Node {
    pub fn new(address: SocketAddr, now: SystemTime) -> Self {
        Self {
            address,
            num_seen: 1,
            num_attempts: 0,
            last_seen: Some(now),
            last_attempted: None,
            last_connected: None,
            last_succeeded: None,
        }
    }

    /// Whether this node may be handed out as a connection candidate at `now`.
    ///
    /// Never-tried nodes on the right port always qualify. Tried nodes must
    /// be under the retry ceiling, out of cooldown since their last attempt,
    /// and not recently confirmed good.
    pub fn is_eligible(&self, now: SystemTime, policy: &RetrievalPolicy) -> bool {
        if self.address.port() != policy.default_port {
            return false;
        }
        if self.num_attempts >= policy.max_attempts {
            return false;
        }
        if within(self.last_attempted, now, policy.cooldown) {
            return false;
        }
        if within(self.last_succeeded, now, policy.success_recency) {
            return false;
        }
        // Handshake completed after the last success but never confirmed:
        // the session is likely still coming up.
        let unconfirmed = match (self.last_connected, self.last_succeeded) {
            (Some(connected), Some(succeeded)) => connected > succeeded,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if unconfirmed && within(self.last_connected, now, policy.cooldown) {
            return false;
        }
        true
    }
}

/// True if `at` happened less than `window` before `now`.
///
/// Timestamps from the future count as recent.
fn within(at: Option<SystemTime>, now: SystemTime, window: Duration) -> bool {
    match at {
        Some(at) => match now.duration_since(at) {
            Ok(elapsed) => elapsed < window,
            Err(_) => true,
        },
        None => false,
    }
}

/// Parameters of [`Node::is_eligible`].
#[derive(Debug, Clone)]
pub struct RetrievalPolicy {
    pub default_port: u16,
    pub max_attempts: u64,
    pub cooldown: Duration,
    pub success_recency: Duration,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self {
            default_port: 18333,
            max_attempts: 3,
            cooldown: Duration::from_secs(5 * 60),
            success_recency: Duration::from_secs(15 * 60),
        }
    }
}
