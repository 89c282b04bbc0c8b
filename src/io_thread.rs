//! Per-thread event loop owning a set of bridged channels, plus the pool that
//! round-robins new pairs across threads.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::ArrayQueue;
use slab::Slab;
use tracing::{debug, error, warn};

use crate::channel::{decode_token, encode_token, DirectChannel, SOCKET_A, SOCKET_B};
use crate::event::PollEvent;
use crate::metrics;
use crate::poller::{Poller, PollerFactory, MAX_POLL_EVENTS};
use crate::socket::Socket;

/// Capacity of each thread's adoption queue. A full queue pushes back on the
/// accept loop: the pair is rejected and its descriptors closed.
pub const ADOPTION_QUEUE_CAPACITY: usize = 1024;

/// Poll timeout when no channel can make progress. The millisecond floor
/// keeps an idle thread from busy-spinning; a non-empty ready set collapses
/// it to zero.
const IDLE_POLL_TIMEOUT_MS: i32 = 1;

/// Returned by `add_channel` when the target thread's adoption queue is full.
/// The rejected pair's descriptors are closed before this is returned.
#[derive(Debug, thiserror::Error)]
#[error("adoption queue full")]
pub struct AdoptionQueueFull;

struct PendingChannel {
    a: Socket,
    b: Socket,
}

/// Handle to one I/O thread: an adoption queue, a terminate flag and the
/// joinable OS thread. Dropping the handle terminates and joins the thread,
/// closing every channel it still owns.
pub struct IoThread {
    id: usize,
    queue: Arc<ArrayQueue<PendingChannel>>,
    terminate: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IoThread {
    pub fn spawn(id: usize, poller_factory: &dyn PollerFactory) -> io::Result<Self> {
        let poller = poller_factory.create_poller()?;
        let queue = Arc::new(ArrayQueue::new(ADOPTION_QUEUE_CAPACITY));
        let terminate = Arc::new(AtomicBool::new(false));

        let worker = IoLoop {
            thread_id: id,
            poller,
            queue: Arc::clone(&queue),
            terminate: Arc::clone(&terminate),
            channels: Slab::new(),
            ready: HashSet::new(),
            terminated: HashSet::new(),
            events: vec![PollEvent::default(); MAX_POLL_EVENTS],
            scratch: Vec::new(),
            next_channel_id: 0,
        };

        let handle = thread::Builder::new()
            .name(format!("io-{id}"))
            .spawn(move || worker.run())?;

        Ok(Self {
            id,
            queue,
            terminate,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Hand a connected (or connect-pending) pair to this thread. Fire and
    /// forget: after adoption there is no error channel back to the caller.
    pub fn add_channel(&self, a: Socket, b: Socket) -> Result<(), AdoptionQueueFull> {
        match self.queue.push(PendingChannel { a, b }) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                metrics::inc_adoptions_rejected();
                drop(rejected);
                Err(AdoptionQueueFull)
            }
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.terminate.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The state owned by the OS thread itself. Everything here is
/// single-threaded; the adoption queue is the only cross-thread structure.
struct IoLoop {
    thread_id: usize,
    poller: Box<dyn Poller + Send>,
    queue: Arc<ArrayQueue<PendingChannel>>,
    terminate: Arc<AtomicBool>,
    channels: Slab<DirectChannel>,
    /// Channels that may still make progress without another poll event.
    ready: HashSet<usize>,
    /// Channels with both sockets closed, awaiting reap.
    terminated: HashSet<usize>,
    events: Vec<PollEvent>,
    scratch: Vec<usize>,
    next_channel_id: u64,
}

impl IoLoop {
    fn run(mut self) {
        debug!(thread = self.thread_id, "io thread started");
        while !self.terminate.load(Ordering::Relaxed) {
            self.adopt_pending();
            self.poll();
            self.perform_io();
            self.reap();
        }
        self.shutdown_all();
        debug!(thread = self.thread_id, "io thread stopped");
    }

    fn adopt_pending(&mut self) {
        while let Some(pending) = self.queue.pop() {
            self.adopt(pending);
        }
    }

    fn adopt(&mut self, pending: PendingChannel) {
        let id = self.next_channel_id;
        self.next_channel_id += 1;

        let a_fd = pending.a.fd();
        let b_fd = pending.b.fd();
        debug!(
            thread = self.thread_id,
            channel = id,
            a_fd,
            b_fd,
            "adopting channel"
        );

        let key = self
            .channels
            .insert(DirectChannel::new(id, pending.a, pending.b));

        if let Err(e) = self.poller.add(a_fd, encode_token(key, a_fd, SOCKET_A)) {
            error!(channel = id, fd = a_fd, error = %e, "poller registration failed, dropping channel");
            self.channels.remove(key);
            return;
        }
        if let Err(e) = self.poller.add(b_fd, encode_token(key, b_fd, SOCKET_B)) {
            error!(channel = id, fd = b_fd, error = %e, "poller registration failed, dropping channel");
            self.poller.remove(a_fd);
            self.channels.remove(key);
            return;
        }

        let channel = &mut self.channels[key];
        channel.socket_mut(SOCKET_A).mark_registered();
        channel.socket_mut(SOCKET_B).mark_registered();
        metrics::inc_channels_adopted();
    }

    fn poll(&mut self) {
        let timeout = if self.ready.is_empty() {
            IDLE_POLL_TIMEOUT_MS
        } else {
            0
        };

        let count = match self.poller.poll(&mut self.events, timeout) {
            Ok(count) => count,
            Err(e) => {
                // best effort: skip this iteration, the loop keeps running
                error!(thread = self.thread_id, error = %e, "poller failure");
                return;
            }
        };

        for i in 0..count {
            let event = self.events[i];
            metrics::inc_poll_events();

            let (key, fd, index) = decode_token(event.token);
            let channel = match self.channels.get_mut(key) {
                Some(channel) if channel.socket(index).fd() == fd => channel,
                // the slab slot was reaped (and possibly reused) after the
                // kernel queued this event; nothing to route it to
                _ => {
                    warn!(
                        thread = self.thread_id,
                        token = event.token,
                        "event for stale channel"
                    );
                    continue;
                }
            };

            channel.apply_event(index, event.flags, &*self.poller);
            self.ready.insert(key);
        }
    }

    fn perform_io(&mut self) {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        scratch.extend(self.ready.iter().copied());

        for &key in &scratch {
            let Some(channel) = self.channels.get_mut(key) else {
                self.ready.remove(&key);
                continue;
            };

            channel.perform_io(&*self.poller);

            if !channel.can_read_write_more() {
                // the poller re-adds on the next edge
                self.ready.remove(&key);
            }
            if channel.can_be_terminated() {
                debug!(
                    thread = self.thread_id,
                    channel = channel.id(),
                    "channel finished"
                );
                self.terminated.insert(key);
            }
        }

        self.scratch = scratch;
    }

    fn reap(&mut self) {
        if self.terminated.is_empty() {
            return;
        }
        for key in self.terminated.drain() {
            self.ready.remove(&key);
            if self.channels.contains(key) {
                self.channels.remove(key);
                metrics::inc_channels_reaped();
            }
        }
    }

    /// Thread shutdown: close every live channel on its owning thread so
    /// descriptors and registrations are released in order.
    fn shutdown_all(&mut self) {
        for (_, channel) in self.channels.iter_mut() {
            channel.shutdown(&*self.poller);
        }
        let dropped = self.channels.len();
        if dropped > 0 {
            debug!(
                thread = self.thread_id,
                channels = dropped,
                "dropped live channels"
            );
        }
        self.channels.clear();
        self.ready.clear();
        self.terminated.clear();
    }
}

/// Fixed set of I/O threads with round-robin channel assignment.
pub struct IoThreadPool {
    threads: Vec<IoThread>,
    next: AtomicUsize,
}

impl IoThreadPool {
    pub fn new(size: usize, poller_factory: &dyn PollerFactory) -> io::Result<Self> {
        assert!(size > 0, "pool requires at least one thread");
        let mut threads = Vec::with_capacity(size);
        for id in 0..size {
            threads.push(IoThread::spawn(id, poller_factory)?);
        }
        Ok(Self {
            threads,
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Assign a pair to the next thread in round-robin order. Adoptions are
    /// rare relative to I/O events, so a single shared counter is plenty.
    pub fn add_channel(&self, a: Socket, b: Socket) -> Result<(), AdoptionQueueFull> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[index].add_channel(a, b)
    }
}
