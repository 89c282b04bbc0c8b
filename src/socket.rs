//! Per-descriptor half-duplex state machine: connect completion, half-close,
//! drain-then-close, and `EAGAIN`-driven flow control.

use std::io;
use std::os::unix::io::RawFd;

use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::event::IoFlags;
use crate::metrics;
use crate::poller::Poller;

pub type ReadFn = Box<dyn FnMut(RawFd, &mut [u8]) -> io::Result<usize> + Send>;
pub type WriteFn = Box<dyn FnMut(RawFd, &[u8]) -> io::Result<usize> + Send>;
pub type CloseFn = Box<dyn FnMut(RawFd) -> io::Result<()> + Send>;

/// I/O vtable with POSIX semantics: `Ok(0)` from `read` is EOF, `Ok(0)` from a
/// zero-length `write` is the connected probe, `WouldBlock` is flow control.
/// Production sockets use [`SocketImpl::system`]; tests substitute closures.
pub struct SocketImpl {
    pub read: ReadFn,
    pub write: WriteFn,
    pub close: CloseFn,
}

impl SocketImpl {
    /// Vtable wired to the real syscalls.
    pub fn system() -> Self {
        Self {
            read: Box::new(|fd, buf| {
                let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }),
            write: Box::new(|fd, buf| {
                let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }),
            close: Box::new(|fd| {
                if unsafe { libc::close(fd) } == -1 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            }),
        }
    }
}

/// One endpoint of a bridged pair.
///
/// A socket reads from its descriptor *into its peer's buffer* and writes
/// *from its own buffer* to its descriptor, so the buffer owned by B stages
/// the A→B byte stream. All peer access goes through explicit parameters; the
/// owning [`DirectChannel`](crate::channel::DirectChannel) holds both sockets
/// adjacent and supplies the pairing.
pub struct Socket {
    fd: RawFd,
    io: SocketImpl,
    connected: bool,
    input_closed: bool,
    output_closed: bool,
    input_ready: bool,
    output_ready: bool,
    registered: bool,
    buffer: Buffer,
}

impl Socket {
    /// Wrap a non-blocking stream descriptor. The socket starts unconnected;
    /// the first `OutputReady` or `Error` event drives [`check_connected`],
    /// which covers both freshly accepted descriptors and `EINPROGRESS`
    /// outbound connects.
    ///
    /// [`check_connected`]: Socket::check_connected
    pub fn new(fd: RawFd, io: SocketImpl) -> Self {
        debug_assert!(fd >= 0);
        Self {
            fd,
            io,
            connected: false,
            input_closed: false,
            output_closed: false,
            input_ready: false,
            output_ready: false,
            registered: false,
            buffer: Buffer::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn on_connected(&mut self) {
        self.connected = true;
    }

    pub fn closed(&self) -> bool {
        self.input_closed && self.output_closed
    }

    pub fn input_closed(&self) -> bool {
        self.input_closed
    }

    pub fn output_closed(&self) -> bool {
        self.output_closed
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Marks the descriptor as registered with the owning thread's poller, so
    /// close can deregister it. Deregistration always precedes the descriptor
    /// close.
    pub fn mark_registered(&mut self) {
        self.registered = true;
    }

    /// Fold a poll event into the optimistic readiness hints. An error event
    /// raises both hints so the next syscall surfaces the actual condition.
    pub fn apply_event_flags(&mut self, flags: IoFlags) {
        if flags.contains(IoFlags::ERROR) {
            self.input_ready = true;
            self.output_ready = true;
            return;
        }
        if flags.contains(IoFlags::INPUT_READY) {
            self.input_ready = true;
        }
        if flags.contains(IoFlags::OUTPUT_READY) {
            self.output_ready = true;
        }
    }

    /// A further `read_input` call could make progress right now.
    pub fn can_read_more(&self, peer: &Socket) -> bool {
        self.connected
            && !self.input_closed
            && self.input_ready
            && peer.buffer.has_remaining_capacity()
    }

    /// A further `write_output` call could make progress right now.
    pub fn can_write_more(&self) -> bool {
        self.connected && !self.output_closed && self.output_ready && !self.buffer.consumed()
    }

    /// Issue at most one read from this descriptor into the peer's buffer.
    /// Returns whether forward progress was made.
    ///
    /// EOF and read errors close the whole socket; `EAGAIN` clears the input
    /// hint; a full peer buffer skips the syscall entirely until the peer
    /// drains.
    pub fn read_input(&mut self, peer: &mut Socket, poller: &dyn Poller) -> bool {
        if peer.output_closed && !self.input_closed {
            debug!(fd = self.fd, "peer output closed, closing input");
            self.input_closed = true;
            return false;
        }

        if !self.connected || self.input_closed {
            return false;
        }

        if !self.input_ready || !peer.buffer.has_remaining_capacity() {
            return false;
        }

        let mut progressed = false;
        match (self.io.read)(self.fd, peer.buffer.free_space()) {
            Ok(0) => {
                debug!(fd = self.fd, "read eof, closing input");
                self.input_closed = true;
            }
            Ok(n) => {
                peer.buffer.produce(n);
                metrics::add_bytes_relayed(n);
                progressed = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.input_ready = false;
            }
            Err(e) => {
                warn!(fd = self.fd, error = %e, "read failed, closing input");
                self.input_closed = true;
            }
        }

        if self.input_closed {
            self.close(peer, poller);
            return false;
        }
        progressed
    }

    /// Write pending bytes from this socket's own buffer to its descriptor,
    /// looping until drained or `EAGAIN`. Returns whether forward progress was
    /// made.
    ///
    /// Once the peer is fully closed and the buffer is drained, the socket
    /// closes itself: this is the drain-then-close half of an orderly EOF.
    pub fn write_output(&mut self, peer: &mut Socket, poller: &dyn Poller) -> bool {
        if !self.connected || self.output_closed {
            return false;
        }

        let mut progressed = false;
        while self.output_ready && !self.buffer.consumed() {
            match (self.io.write)(self.fd, self.buffer.pending()) {
                Ok(0) => break,
                Ok(n) => {
                    self.buffer.consume(n);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.output_ready = false;
                }
                Err(e) => {
                    warn!(fd = self.fd, error = %e, "write failed, closing");
                    self.close(peer, poller);
                    return false;
                }
            }
        }

        if self.buffer.consumed() {
            self.buffer.reset();
        }

        if peer.closed() && self.buffer.consumed() && !self.closed() {
            debug!(fd = self.fd, "drained after peer close, closing");
            self.close(peer, poller);
        }

        progressed
    }

    /// Probe an in-flight non-blocking connect with a zero-length write:
    /// `Ok(0)` means the connect completed, `WouldBlock` means still pending,
    /// anything else is the pending connect error and closes the socket.
    pub fn check_connected(&mut self, peer: &mut Socket, poller: &dyn Poller) {
        match (self.io.write)(self.fd, &[]) {
            Ok(_) => {
                debug!(fd = self.fd, "connected");
                self.connected = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(fd = self.fd, error = %e, "connect failed, closing");
                self.close(peer, poller);
            }
        }
    }

    /// Idempotent full close: mark both halves closed, deregister from the
    /// poller, close the descriptor, then notify the peer.
    pub fn close(&mut self, peer: &mut Socket, poller: &dyn Poller) {
        if self.closed() {
            return;
        }
        self.input_closed = true;
        self.output_closed = true;

        if self.registered {
            self.registered = false;
            poller.remove(self.fd);
        }

        debug!(fd = self.fd, "close");
        if let Err(e) = (self.io.close)(self.fd) {
            warn!(fd = self.fd, error = %e, "close failed");
        }

        peer.on_peer_closed(self, poller);
    }

    /// The peer has fully closed. Drain any buffered output one last time
    /// (which closes this socket too once the buffer empties); if the peer
    /// still held bytes it never delivered, that stream is torn mid-flight and
    /// this side aborts immediately.
    fn on_peer_closed(&mut self, peer: &mut Socket, poller: &dyn Poller) {
        if self.closed() {
            return;
        }
        debug!(fd = self.fd, "peer closed, draining");
        self.write_output(peer, poller);

        if !self.closed() && !peer.buffer.consumed() {
            debug!(fd = self.fd, "peer closed with undelivered data, closing");
            self.close(peer, poller);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if !self.closed() {
            debug!(fd = self.fd, "closing on drop");
            self.input_closed = true;
            self.output_closed = true;
            let _ = (self.io.close)(self.fd);
        }
    }
}
