//! A bridged pair of sockets and the token scheme that routes poll events
//! back to it.

use std::os::unix::io::RawFd;

use crate::event::IoFlags;
use crate::poller::Poller;
use crate::socket::Socket;

pub const SOCKET_A: usize = 0;
pub const SOCKET_B: usize = 1;

/// Pack a channel's slab key, a descriptor and a socket index into the u64
/// the poller carries: `[key:31][fd:32][index:1]`. Events route back to the
/// owning channel with plain shifts, and the embedded fd lets the event loop
/// discard events whose slab key has been reused by a newer channel.
pub fn encode_token(key: usize, fd: RawFd, index: usize) -> u64 {
    debug_assert!(key < (1 << 31));
    debug_assert!(index <= SOCKET_B);
    ((key as u64) << 33) | ((fd as u32 as u64) << 1) | index as u64
}

/// Inverse of [`encode_token`]: `(key, fd, index)`.
pub fn decode_token(token: u64) -> (usize, RawFd, usize) {
    let index = (token & 1) as usize;
    let fd = ((token >> 1) & 0xFFFF_FFFF) as u32 as RawFd;
    let key = (token >> 33) as usize;
    (key, fd, index)
}

/// Exclusive owner of two cross-wired sockets. Lifetime runs from adoption by
/// an I/O thread until both sockets are closed and the thread reaps it.
pub struct DirectChannel {
    id: u64,
    sockets: [Socket; 2],
}

impl DirectChannel {
    pub fn new(id: u64, a: Socket, b: Socket) -> Self {
        Self {
            id,
            sockets: [a, b],
        }
    }

    /// Stable per-thread id, for logging only.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn socket(&self, index: usize) -> &Socket {
        &self.sockets[index]
    }

    pub fn socket_mut(&mut self, index: usize) -> &mut Socket {
        &mut self.sockets[index]
    }

    /// Borrow `(socket, peer)` for the given index.
    pub fn pair_mut(&mut self, index: usize) -> (&mut Socket, &mut Socket) {
        assert!(index <= SOCKET_B);
        let [a, b] = &mut self.sockets;
        if index == SOCKET_A {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Fold one poll event into the addressed socket's readiness hints, and
    /// complete an in-flight connect when writability (or an error) first
    /// shows up for an unconnected socket.
    pub fn apply_event(&mut self, index: usize, flags: IoFlags, poller: &dyn Poller) {
        let (socket, peer) = self.pair_mut(index);
        socket.apply_event_flags(flags);
        if !socket.connected() && flags.intersects(IoFlags::OUTPUT_READY | IoFlags::ERROR) {
            socket.check_connected(peer, poller);
        }
    }

    /// Unconditional four-call sequence: read both sides, then write both
    /// sides. The socket state machine turns the inapplicable calls into
    /// cheap no-ops, which keeps the ordering trivial to reason about.
    pub fn perform_io(&mut self, poller: &dyn Poller) {
        let [a, b] = &mut self.sockets;
        a.read_input(b, poller);
        b.read_input(a, poller);
        a.write_output(b, poller);
        b.write_output(a, poller);
    }

    /// True iff any of the four `perform_io` calls could still make progress
    /// without another poll event.
    pub fn can_read_write_more(&self) -> bool {
        let [a, b] = &self.sockets;
        a.can_read_more(b) || b.can_read_more(a) || a.can_write_more() || b.can_write_more()
    }

    pub fn can_be_terminated(&self) -> bool {
        self.sockets[SOCKET_A].closed() && self.sockets[SOCKET_B].closed()
    }

    /// Close both sides, deregistering and notifying as usual. Idempotent;
    /// used when the owning thread shuts down with live channels.
    pub fn shutdown(&mut self, poller: &dyn Poller) {
        let [a, b] = &mut self.sockets;
        a.close(b, poller);
        b.close(a, poller);
    }
}
