//! Accept loop and outbound dial. Produces connected (or connect-pending)
//! non-blocking descriptor pairs and hands them to the I/O thread pool.

use std::io;
use std::os::unix::io::IntoRawFd;
use std::sync::Arc;

use socket2::Socket as OsSocket;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::endpoint::{Endpoint, EndpointError};
use crate::io_thread::IoThreadPool;
use crate::socket::{Socket, SocketImpl};

const SO_BACKLOG: i32 = 64;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
}

/// One configured service: a bound listening socket plus the endpoint to dial
/// for every accepted connection.
///
/// The listening socket is intentionally blocking; each service runs its
/// accept loop on a dedicated thread and hands finished pairs off through the
/// pool's adoption queues.
pub struct Listener {
    name: String,
    listen_ep: Endpoint,
    connect_ep: Endpoint,
    socket: OsSocket,
    pool: Arc<IoThreadPool>,
    accept_rcvbuf: Option<usize>,
    accept_sndbuf: Option<usize>,
    peer_rcvbuf: Option<usize>,
    peer_sndbuf: Option<usize>,
}

impl Listener {
    pub fn bind(config: &ServiceConfig, pool: Arc<IoThreadPool>) -> Result<Self, ListenerError> {
        let listen_ep = Endpoint::from_config(&config.listen)?;
        let connect_ep = Endpoint::from_config(&config.connect)?;

        let socket = listen_ep.create_socket().map_err(ListenerError::Bind)?;
        if listen_ep.is_tcp() {
            socket.set_reuse_address(true).map_err(ListenerError::Bind)?;
        }
        socket
            .bind(&listen_ep.sock_addr())
            .map_err(ListenerError::Bind)?;
        socket.listen(SO_BACKLOG).map_err(ListenerError::Bind)?;

        info!(service = %config.name, listen = %listen_ep, connect = %connect_ep, "listening");

        Ok(Self {
            name: config.name.clone(),
            listen_ep,
            connect_ep,
            socket,
            pool,
            accept_rcvbuf: config.accept_rcvbuf,
            accept_sndbuf: config.accept_sndbuf,
            peer_rcvbuf: config.peer_rcvbuf,
            peer_sndbuf: config.peer_sndbuf,
        })
    }

    /// Accept forever. Per-connection failures drop that connection only.
    pub fn run(self) {
        loop {
            self.accept_one();
        }
    }

    fn accept_one(&self) {
        let (conn, _addr) = match self.socket.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(service = %self.name, error = %e, "accept failed");
                return;
            }
        };

        if let Err(e) = self.prepare_accepted(&conn) {
            error!(service = %self.name, error = %e, "failed to prepare accepted socket");
            return;
        }

        let outbound = match self.connect_to_peer() {
            Ok(socket) => socket,
            Err(e) => {
                warn!(service = %self.name, connect = %self.connect_ep, error = %e, "connect failed");
                return;
            }
        };

        let a = Socket::new(conn.into_raw_fd(), SocketImpl::system());
        let b = Socket::new(outbound.into_raw_fd(), SocketImpl::system());
        debug!(service = %self.name, a_fd = a.fd(), b_fd = b.fd(), "dispatching accepted connection");

        if self.pool.add_channel(a, b).is_err() {
            warn!(service = %self.name, "adoption queue full, dropping connection");
        }
    }

    fn prepare_accepted(&self, conn: &OsSocket) -> io::Result<()> {
        conn.set_nonblocking(true)?;
        if self.listen_ep.is_tcp() {
            conn.set_nodelay(true)?;
        }
        if let Some(size) = self.accept_rcvbuf {
            conn.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.accept_sndbuf {
            conn.set_send_buffer_size(size)?;
        }
        Ok(())
    }

    /// Dial the peer endpoint without blocking; `EINPROGRESS` is success, the
    /// I/O thread completes the connect when writability shows up.
    fn connect_to_peer(&self) -> io::Result<OsSocket> {
        let socket = self.connect_ep.create_socket()?;
        socket.set_nonblocking(true)?;
        if self.connect_ep.is_tcp() {
            socket.set_nodelay(true)?;
        }
        if let Some(size) = self.peer_rcvbuf {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.peer_sndbuf {
            socket.set_send_buffer_size(size)?;
        }

        match socket.connect(&self.connect_ep.sock_addr()) {
            Ok(()) => {}
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        Ok(socket)
    }
}
