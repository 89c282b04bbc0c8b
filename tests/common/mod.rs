#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vsock_relay::event::PollEvent;
use vsock_relay::poller::{Poller, PollerFactory};
use vsock_relay::socket::{ReadFn, SocketImpl, WriteFn};

pub fn would_block() -> io::Error {
    io::Error::from(io::ErrorKind::WouldBlock)
}

pub type Sink = Arc<Mutex<Vec<u8>>>;

pub fn sink() -> Sink {
    Arc::new(Mutex::new(Vec::new()))
}

/// Serve `data` across as many reads as the caller issues, then EOF.
pub fn reads_fixed(data: Vec<u8>) -> ReadFn {
    let mut offset = 0;
    Box::new(move |_, buf| {
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        offset += n;
        Ok(n)
    })
}

pub fn reads_would_block() -> ReadFn {
    Box::new(|_, _| Err(would_block()))
}

pub fn reads_must_not_call(message: &'static str) -> ReadFn {
    Box::new(move |_, _| panic!("unexpected read: {message}"))
}

/// Accept everything into `sink`.
pub fn writes_all(sink: Sink) -> WriteFn {
    Box::new(move |_, buf| {
        sink.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    })
}

pub fn writes_would_block() -> WriteFn {
    Box::new(|_, _| Err(would_block()))
}

pub fn writes_must_not_call(message: &'static str) -> WriteFn {
    Box::new(move |_, buf| {
        // the zero-length connected probe is not payload delivery
        if buf.is_empty() {
            return Ok(0);
        }
        panic!("unexpected write: {message}")
    })
}

/// Accept `chunk` bytes, then report `EAGAIN` on the following call, then
/// accept another chunk, and so on. Models a slow sink whose writability
/// keeps toggling; the driver re-raises `OUTPUT_READY` between iterations.
pub fn writes_trickle(sink: Sink, chunk: usize) -> WriteFn {
    let mut blocked = false;
    Box::new(move |_, buf| {
        if buf.is_empty() {
            return Ok(0);
        }
        if blocked {
            blocked = false;
            return Err(would_block());
        }
        blocked = true;
        let n = chunk.min(buf.len());
        sink.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(n)
    })
}

/// Record closed descriptors.
pub fn closes_recording(log: Arc<Mutex<Vec<RawFd>>>) -> Box<dyn FnMut(RawFd) -> io::Result<()> + Send> {
    Box::new(move |fd| {
        log.lock().unwrap().push(fd);
        Ok(())
    })
}

pub fn socket_impl(read: ReadFn, write: WriteFn) -> SocketImpl {
    SocketImpl {
        read,
        write,
        close: Box::new(|_| Ok(())),
    }
}

#[derive(Default)]
pub struct PollerState {
    /// `(fd, token)` pairs in registration order.
    pub registered: Vec<(RawFd, u64)>,
    pub removed: Vec<RawFd>,
    /// Each poll call pops one batch; empty script polls return no events.
    pub script: VecDeque<Vec<PollEvent>>,
    /// Registration of these fds fails.
    pub fail_fds: Vec<RawFd>,
    pub poll_timeouts: Vec<i32>,
}

/// Deterministic poller: registrations are recorded, events are scripted.
/// Shared through an `Arc` so tests can inspect state while an I/O thread
/// owns the other handle.
#[derive(Clone, Default)]
pub struct MockPoller {
    pub state: Arc<Mutex<PollerState>>,
}

impl MockPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_events(&self, events: Vec<PollEvent>) {
        self.state.lock().unwrap().script.push_back(events);
    }

    pub fn registered(&self) -> Vec<(RawFd, u64)> {
        self.state.lock().unwrap().registered.clone()
    }

    pub fn removed(&self) -> Vec<RawFd> {
        self.state.lock().unwrap().removed.clone()
    }
}

impl Poller for MockPoller {
    fn add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_fds.contains(&fd) {
            return Err(io::Error::from(io::ErrorKind::OutOfMemory));
        }
        state.registered.push((fd, token));
        Ok(())
    }

    fn remove(&self, fd: RawFd) {
        self.state.lock().unwrap().removed.push(fd);
    }

    fn poll(&mut self, out: &mut [PollEvent], timeout_ms: i32) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.poll_timeouts.push(timeout_ms);
        let Some(batch) = state.script.pop_front() else {
            return Ok(0);
        };
        let count = batch.len().min(out.len());
        out[..count].copy_from_slice(&batch[..count]);
        Ok(count)
    }
}

/// Factory handing out handles to pre-built shared pollers, one per
/// `create_poller` call, recorded for later inspection.
pub struct MockPollerFactory {
    pub created: Mutex<Vec<MockPoller>>,
}

impl MockPollerFactory {
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn poller(&self, index: usize) -> MockPoller {
        self.created.lock().unwrap()[index].clone()
    }
}

impl PollerFactory for MockPollerFactory {
    fn create_poller(&self) -> io::Result<Box<dyn Poller + Send>> {
        let poller = MockPoller::new();
        self.created.lock().unwrap().push(poller.clone());
        Ok(Box::new(poller))
    }
}

/// Spin until `condition` holds or the deadline passes.
pub fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
