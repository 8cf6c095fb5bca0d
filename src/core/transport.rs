//! Collaborator seams the core drives: the wire, local paths, and time.
use std::time::Instant;

use crate::common::{Key, Message, PathId};

/// Outbound side of the wire layer. Sends are fire and forget; a lost
/// message is indistinguishable from a lost reply and the request timeout
/// covers both.
pub trait Transport: Send {
    /// Hand `msg` to the wire layer for delivery to `peer`.
    ///
    /// When `keepalive` is set the session to `peer` should be held open
    /// for at least ten seconds, so the reply does not pay for a reconnect.
    fn send(&mut self, peer: Key, msg: Message, keepalive: bool);
}

/// Delivers DHT replies onto a local onion path.
pub trait PathSink: Send {
    fn deliver(&mut self, path: PathId, msg: Message);
}

/// Monotonic milliseconds.
pub trait Clock: Send {
    fn now_ms(&self) -> u64;
}

/// Milliseconds since the clock was created.
#[derive(Debug)]
pub struct MonotonicClock {
    started: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock {
            started: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
