//! IoThread and IoThreadPool behavior against the deterministic mock poller,
//! plus a real-epoll relay over socketpair descriptors.

mod common;

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{closes_recording, wait_for, MockPollerFactory};
use vsock_relay::channel::{encode_token, SOCKET_A, SOCKET_B};
use vsock_relay::event::{IoFlags, PollEvent};
use vsock_relay::io_thread::{IoThread, IoThreadPool};
use vsock_relay::poller::EpollPollerFactory;
use vsock_relay::socket::{Socket, SocketImpl};

const WAIT: Duration = Duration::from_secs(2);

fn eof_impl(closes: Arc<Mutex<Vec<RawFd>>>) -> SocketImpl {
    SocketImpl {
        read: Box::new(|_, _| Ok(0)),
        write: Box::new(|_, buf| {
            assert!(buf.is_empty(), "no payload is ever queued in this test");
            Ok(0)
        }),
        close: closes_recording(closes),
    }
}

#[test]
fn adoption_registers_both_descriptors() {
    let factory = MockPollerFactory::new();
    let thread = IoThread::spawn(0, &factory).unwrap();
    let poller = factory.poller(0);

    let closes = Arc::new(Mutex::new(Vec::new()));
    thread
        .add_channel(
            Socket::new(41, eof_impl(Arc::clone(&closes))),
            Socket::new(42, eof_impl(Arc::clone(&closes))),
        )
        .unwrap();

    assert!(wait_for(|| poller.registered().len() == 2, WAIT));
    let registered = poller.registered();
    assert_eq!(registered[0], (41, encode_token(0, 41, SOCKET_A)));
    assert_eq!(registered[1], (42, encode_token(0, 42, SOCKET_B)));
}

#[test]
fn scripted_events_drive_a_channel_to_termination() {
    let factory = MockPollerFactory::new();
    let thread = IoThread::spawn(0, &factory).unwrap();
    let poller = factory.poller(0);

    let closes = Arc::new(Mutex::new(Vec::new()));
    thread
        .add_channel(
            Socket::new(41, eof_impl(Arc::clone(&closes))),
            Socket::new(42, eof_impl(Arc::clone(&closes))),
        )
        .unwrap();
    assert!(wait_for(|| poller.registered().len() == 2, WAIT));

    // first writability completes the connects; the input edge then reads EOF,
    // which closes one side and drains-then-closes the other
    poller.push_events(vec![
        PollEvent {
            flags: IoFlags::INPUT_READY | IoFlags::OUTPUT_READY,
            token: encode_token(0, 41, SOCKET_A),
        },
        PollEvent {
            flags: IoFlags::OUTPUT_READY,
            token: encode_token(0, 42, SOCKET_B),
        },
    ]);

    assert!(wait_for(|| poller.removed().len() == 2, WAIT));
    assert_eq!(poller.removed(), vec![41, 42]);
    assert!(wait_for(|| closes.lock().unwrap().len() == 2, WAIT));
    assert_eq!(closes.lock().unwrap().as_slice(), &[41, 42]);
}

#[test]
fn registration_failure_drops_the_channel() {
    let factory = MockPollerFactory::new();
    let thread = IoThread::spawn(0, &factory).unwrap();
    let poller = factory.poller(0);
    poller.state.lock().unwrap().fail_fds.push(42);

    let closes = Arc::new(Mutex::new(Vec::new()));
    thread
        .add_channel(
            Socket::new(41, eof_impl(Arc::clone(&closes))),
            Socket::new(42, eof_impl(Arc::clone(&closes))),
        )
        .unwrap();

    assert!(wait_for(|| closes.lock().unwrap().len() == 2, WAIT));
    // the successfully registered descriptor was deregistered again
    assert_eq!(poller.removed(), vec![41]);
    assert_eq!(poller.registered().len(), 1);
    let mut closed = closes.lock().unwrap().clone();
    closed.sort_unstable();
    assert_eq!(closed, vec![41, 42]);
}

#[test]
fn dropping_the_thread_closes_live_channels() {
    let factory = MockPollerFactory::new();
    let thread = IoThread::spawn(0, &factory).unwrap();
    let poller = factory.poller(0);

    let closes = Arc::new(Mutex::new(Vec::new()));
    let idle = || SocketImpl {
        read: Box::new(|_, _| Err(common::would_block())),
        write: Box::new(|_, buf| {
            if buf.is_empty() {
                return Ok(0);
            }
            Err(common::would_block())
        }),
        close: closes_recording(Arc::clone(&closes)),
    };
    thread
        .add_channel(Socket::new(41, idle()), Socket::new(42, idle()))
        .unwrap();
    assert!(wait_for(|| poller.registered().len() == 2, WAIT));

    drop(thread);

    assert_eq!(poller.removed(), vec![41, 42]);
    assert_eq!(closes.lock().unwrap().as_slice(), &[41, 42]);
}

#[test]
fn pool_round_robins_across_threads() {
    let factory = MockPollerFactory::new();
    let pool = IoThreadPool::new(2, &factory).unwrap();
    assert_eq!(pool.size(), 2);

    let closes = Arc::new(Mutex::new(Vec::new()));
    for fd in [10, 12, 14, 16] {
        pool.add_channel(
            Socket::new(fd, eof_impl(Arc::clone(&closes))),
            Socket::new(fd + 1, eof_impl(Arc::clone(&closes))),
        )
        .unwrap();
    }

    let poller0 = factory.poller(0);
    let poller1 = factory.poller(1);
    assert!(wait_for(
        || poller0.registered().len() == 4 && poller1.registered().len() == 4,
        WAIT
    ));

    let fds = |poller: &common::MockPoller| -> Vec<RawFd> {
        poller.registered().iter().map(|&(fd, _)| fd).collect()
    };
    assert_eq!(fds(&poller0), vec![10, 11, 14, 15]);
    assert_eq!(fds(&poller1), vec![12, 13, 16, 17]);
}

// ---- real descriptors ----

fn socket_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair failed");
    for fd in fds {
        set_nonblocking(fd);
    }
    (fds[0], fds[1])
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        assert!(flags != -1);
        assert!(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != -1);
    }
}

struct Fd(RawFd);

impl Drop for Fd {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

impl Fd {
    fn close(&mut self) {
        unsafe {
            libc::close(self.0);
        }
        self.0 = -1;
    }
}

impl Read for Fd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for Fd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read exactly `len` bytes, retrying over `EAGAIN` until the deadline.
fn read_exact_with_deadline(fd: &mut Fd, len: usize) -> Vec<u8> {
    let deadline = Instant::now() + WAIT;
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 4096];
    while out.len() < len {
        match fd.read(&mut buf) {
            Ok(0) => panic!("unexpected eof after {} bytes", out.len()),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "timed out after {} bytes", out.len());
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => panic!("read failed: {e}"),
        }
    }
    out
}

fn read_eof_with_deadline(fd: &mut Fd) {
    let deadline = Instant::now() + WAIT;
    let mut buf = [0u8; 4096];
    loop {
        match fd.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "timed out waiting for eof");
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => panic!("read failed: {e}"),
        }
    }
}

fn write_all_with_deadline(fd: &mut Fd, mut data: &[u8]) {
    let deadline = Instant::now() + WAIT;
    while !data.is_empty() {
        match fd.write(data) {
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "timed out writing");
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => panic!("write failed: {e}"),
        }
    }
}

#[test]
fn relays_bytes_between_real_descriptors() {
    let pool = IoThreadPool::new(1, &EpollPollerFactory).unwrap();

    let (client_a, bridge_a) = socket_pair();
    let (client_b, bridge_b) = socket_pair();
    let mut client_a = Fd(client_a);
    let mut client_b = Fd(client_b);

    pool.add_channel(
        Socket::new(bridge_a, SocketImpl::system()),
        Socket::new(bridge_b, SocketImpl::system()),
    )
    .unwrap();

    // forward direction
    let forward = b"hello across the bridge";
    write_all_with_deadline(&mut client_a, forward);
    assert_eq!(read_exact_with_deadline(&mut client_b, forward.len()), forward);

    // reverse direction: the two streams are independent
    let reverse = b"and back the other way";
    write_all_with_deadline(&mut client_b, reverse);
    assert_eq!(read_exact_with_deadline(&mut client_a, reverse.len()), reverse);

    // larger-than-buffer payload survives the staging buffer
    let bulk: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let bulk_clone = bulk.clone();
    let writer = std::thread::spawn(move || {
        write_all_with_deadline(&mut client_a, &bulk_clone);
        client_a
    });
    assert_eq!(read_exact_with_deadline(&mut client_b, bulk.len()), bulk);
    let mut client_a = writer.join().unwrap();

    // orderly shutdown propagates eof to the far side
    client_a.close();
    read_eof_with_deadline(&mut client_b);

    drop(pool);
}
