//! Edge-triggered readiness polling, abstracted behind a trait so tests can
//! substitute a deterministic implementation.

use std::io;
use std::os::unix::io::RawFd;

use tracing::warn;

use crate::event::{IoFlags, PollEvent};

/// Number of events fetched per poll call.
pub const MAX_POLL_EVENTS: usize = 256;

/// Edge-triggered readiness multiplexer.
///
/// Registrations persist until [`remove`](Poller::remove) or descriptor close.
/// Each not-ready → ready transition fires exactly one event; consumers must
/// drain to `EAGAIN` before the next event for the same condition arrives.
pub trait Poller: Send {
    /// Register `fd`, attaching an opaque `token` returned with its events.
    fn add(&self, fd: RawFd, token: u64) -> io::Result<()>;

    /// Deregister `fd`. Failures are logged, not surfaced; the caller is
    /// usually about to close the descriptor anyway.
    fn remove(&self, fd: RawFd);

    /// Wait up to `timeout_ms` for events, writing them into `out`.
    /// Returns the number of events written; zero on timeout.
    fn poll(&mut self, out: &mut [PollEvent], timeout_ms: i32) -> io::Result<usize>;
}

/// Creates one poller per I/O thread.
pub trait PollerFactory {
    fn create_poller(&self) -> io::Result<Box<dyn Poller + Send>>;
}

/// `epoll(7)`-backed poller. Interest is always
/// `EPOLLET | EPOLLIN | EPOLLOUT | EPOLLRDHUP`.
pub struct EpollPoller {
    epoll_fd: RawFd,
    native_events: Vec<libc::epoll_event>,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            native_events: Vec::new(),
        })
    }
}

impl Poller for EpollPoller {
    fn add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: (libc::EPOLLET | libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP) as u32,
            u64: token,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn remove(&self, fd: RawFd) {
        // the event argument must be non-null on pre-2.6.9 kernels
        let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut event) };
        if rc == -1 {
            warn!(fd, error = %io::Error::last_os_error(), "epoll_ctl failed to delete fd");
        }
    }

    fn poll(&mut self, out: &mut [PollEvent], timeout_ms: i32) -> io::Result<usize> {
        if self.native_events.len() < out.len() {
            self.native_events
                .resize(out.len(), libc::epoll_event { events: 0, u64: 0 });
        }

        let count = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.native_events.as_mut_ptr(),
                out.len() as i32,
                timeout_ms,
            )
        };
        if count == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for i in 0..count as usize {
            let native = self.native_events[i];
            let bits = native.events as i32;

            let mut flags = IoFlags::NONE;
            if bits & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) != 0 {
                flags = IoFlags::ERROR;
            } else {
                if bits & libc::EPOLLIN != 0 {
                    flags |= IoFlags::INPUT_READY;
                }
                if bits & libc::EPOLLOUT != 0 {
                    flags |= IoFlags::OUTPUT_READY;
                }
            }

            out[i] = PollEvent {
                flags,
                token: native.u64,
            };
        }

        Ok(count as usize)
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

pub struct EpollPollerFactory;

impl PollerFactory for EpollPollerFactory {
    fn create_poller(&self) -> io::Result<Box<dyn Poller + Send>> {
        Ok(Box::new(EpollPoller::new()?))
    }
}
