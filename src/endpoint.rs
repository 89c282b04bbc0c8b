//! Address abstraction over the two supported socket families. The bridge
//! core never sees these; it works on descriptors only.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;

use crate::config::{EndpointConfig, Scheme};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid IPv4 address {0:?}")]
    InvalidAddress(String),
    #[error("invalid vsock cid {0:?}")]
    InvalidCid(String),
}

/// A resolved listen or connect address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Tcp4(SocketAddrV4),
    Vsock { cid: u32, port: u32 },
}

impl Endpoint {
    pub fn from_config(config: &EndpointConfig) -> Result<Self, EndpointError> {
        match config.scheme {
            Scheme::Tcp4 => {
                let ip: Ipv4Addr = config
                    .address
                    .parse()
                    .map_err(|_| EndpointError::InvalidAddress(config.address.clone()))?;
                Ok(Endpoint::Tcp4(SocketAddrV4::new(ip, config.port)))
            }
            Scheme::Vsock => {
                let cid = if config.address == "-1" || config.address.eq_ignore_ascii_case("any") {
                    libc::VMADDR_CID_ANY
                } else {
                    config
                        .address
                        .parse()
                        .map_err(|_| EndpointError::InvalidCid(config.address.clone()))?
                };
                Ok(Endpoint::Vsock {
                    cid,
                    port: config.port as u32,
                })
            }
        }
    }

    /// Create an unbound, unconnected stream socket of the matching family.
    pub fn create_socket(&self) -> io::Result<Socket> {
        match self {
            Endpoint::Tcp4(_) => Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)),
            Endpoint::Vsock { .. } => Socket::new(Domain::VSOCK, Type::STREAM, None),
        }
    }

    pub fn sock_addr(&self) -> SockAddr {
        match *self {
            Endpoint::Tcp4(addr) => addr.into(),
            Endpoint::Vsock { cid, port } => SockAddr::vsock(cid, port),
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp4(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Endpoint::Tcp4(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Vsock { cid, port } if cid == libc::VMADDR_CID_ANY => {
                write!(f, "vsock://-1:{port}")
            }
            Endpoint::Vsock { cid, port } => write!(f, "vsock://{cid}:{port}"),
        }
    }
}
