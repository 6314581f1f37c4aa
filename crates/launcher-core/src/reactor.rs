//! Readiness notification abstraction.
//!
//! # Implementors
//!
//! - `UringReactor` (default): one-shot `IORING_OP_POLL_ADD` per
//!   registration.

use std::fmt;
use std::ops::BitOr;
use std::os::fd::RawFd;

use crate::error::WaitError;

/// Signal bits a waiter asks for and a completion reports.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Signals(u32);

impl Signals {
    pub const NONE: Signals = Signals(0);
    pub const READABLE: Signals = Signals(1 << 0);
    pub const PEER_CLOSED: Signals = Signals(1 << 1);

    #[inline]
    pub fn contains(self, other: Signals) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Signals {
    type Output = Signals;
    fn bitor(self, rhs: Signals) -> Signals {
        Signals(self.0 | rhs.0)
    }
}

impl fmt::Debug for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Signals::READABLE) {
            parts.push("READABLE");
        }
        if self.contains(Signals::PEER_CLOSED) {
            parts.push("PEER_CLOSED");
        }
        write!(f, "Signals({})", if parts.is_empty() { "NONE".to_string() } else { parts.join("|") })
    }
}

/// What a completed wait observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalPacket {
    pub observed: Signals,
    /// How many messages the handler may drain before yielding.
    pub count: usize,
}

/// One completed wait.
#[derive(Debug)]
pub struct Readiness {
    pub key: u64,
    pub result: Result<SignalPacket, WaitError>,
}

/// One-shot readiness registrations keyed by caller-chosen ids.
///
/// **Contract:**
/// - A registration fires at most once. The handler re-registers when it
///   wants more.
/// - `begin_wait()` must NEVER block.
/// - `wait()` blocks until at least one registration completes, and may
///   return an empty batch when interrupted.
pub trait Reactor {
    fn begin_wait(&mut self, key: u64, fd: RawFd, signals: Signals) -> Result<(), WaitError>;

    /// Append completed waits to `out`.
    fn wait(&mut self, out: &mut Vec<Readiness>) -> Result<(), WaitError>;
}
