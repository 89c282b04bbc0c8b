//! Neutral readiness events, decoupled from the OS poller's native encoding.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Readiness bitset reported by a [`Poller`](crate::poller::Poller).
///
/// `ERROR` collapses the native error-class conditions (hangup, read-hangup,
/// socket error) into one flag and takes precedence over the ready flags
/// within a single event.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct IoFlags(u8);

impl IoFlags {
    pub const NONE: IoFlags = IoFlags(0);
    pub const INPUT_READY: IoFlags = IoFlags(0x1);
    pub const OUTPUT_READY: IoFlags = IoFlags(0x4);
    pub const ERROR: IoFlags = IoFlags(0x8);

    /// True if every flag in `other` is set in `self`.
    pub fn contains(self, other: IoFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any flag in `other` is set in `self`.
    pub fn intersects(self, other: IoFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for IoFlags {
    type Output = IoFlags;

    fn bitor(self, rhs: IoFlags) -> IoFlags {
        IoFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoFlags {
    fn bitor_assign(&mut self, rhs: IoFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for IoFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(IoFlags::INPUT_READY) {
            names.push("INPUT_READY");
        }
        if self.contains(IoFlags::OUTPUT_READY) {
            names.push("OUTPUT_READY");
        }
        if self.contains(IoFlags::ERROR) {
            names.push("ERROR");
        }
        if names.is_empty() {
            names.push("NONE");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// One readiness notification. `token` is the opaque value supplied at
/// registration; see [`channel`](crate::channel) for how channel key, fd and
/// socket index are packed into it.
#[derive(Clone, Copy, Debug, Default)]
pub struct PollEvent {
    pub flags: IoFlags,
    pub token: u64,
}
