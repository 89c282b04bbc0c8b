//! Service configuration loader.
//!
//! Handles only the YAML subset the bridge has always used: top-level keys
//! name services, one level of nested `key: value` pairs describes each one.
//!
//! ```yaml
//! ---
//! operator-service:
//!   service: direct
//!   listen: tcp://127.0.0.1:8080
//!   connect: vsock://35:8080
//! ```

use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: unknown service type {value:?}, only \"direct\" is supported")]
    UnknownServiceType { line: usize, value: String },
    #[error("line {line}: invalid endpoint {value:?}")]
    InvalidEndpoint { line: usize, value: String },
    #[error("line {line}: invalid port in {value:?}")]
    InvalidPort { line: usize, value: String },
    #[error("line {line}: invalid buffer size {value:?}")]
    InvalidBufferSize { line: usize, value: String },
    #[error("service {name:?} is missing a {field} endpoint")]
    MissingEndpoint { name: String, field: &'static str },
    #[error("no services configured")]
    NoServices,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp4,
    Vsock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub scheme: Scheme,
    pub address: String,
    pub port: u16,
}

/// One configured bridge: listen here, connect there. The buffer knobs are
/// optional SO_RCVBUF/SO_SNDBUF overrides applied by the listener.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub listen: EndpointConfig,
    pub connect: EndpointConfig,
    pub accept_rcvbuf: Option<usize>,
    pub accept_sndbuf: Option<usize>,
    pub peer_rcvbuf: Option<usize>,
    pub peer_sndbuf: Option<usize>,
}

pub fn load_config(path: &Path) -> Result<Vec<ServiceConfig>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> Result<Vec<ServiceConfig>, ConfigError> {
    let mut services = Vec::new();
    let mut current: Option<PartialService> = None;

    for (index, raw) in text.lines().enumerate() {
        let number = index + 1;
        let line = raw.trim_end();
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed == "---" || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - trimmed.len();
        let trimmed = trimmed.strip_prefix("- ").unwrap_or(trimmed);

        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if indent == 0 {
            if let Some(done) = current.take() {
                done.finish(&mut services)?;
            }
            current = Some(PartialService::new(key));
        } else if let Some(service) = current.as_mut() {
            service.apply(number, key, value)?;
        }
    }

    if let Some(done) = current.take() {
        done.finish(&mut services)?;
    }

    if services.is_empty() {
        return Err(ConfigError::NoServices);
    }
    Ok(services)
}

struct PartialService {
    name: String,
    is_direct: bool,
    listen: Option<EndpointConfig>,
    connect: Option<EndpointConfig>,
    accept_rcvbuf: Option<usize>,
    accept_sndbuf: Option<usize>,
    peer_rcvbuf: Option<usize>,
    peer_sndbuf: Option<usize>,
}

impl PartialService {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_direct: false,
            listen: None,
            connect: None,
            accept_rcvbuf: None,
            accept_sndbuf: None,
            peer_rcvbuf: None,
            peer_sndbuf: None,
        }
    }

    fn apply(&mut self, line: usize, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "service" => {
                if value != "direct" {
                    return Err(ConfigError::UnknownServiceType {
                        line,
                        value: value.to_string(),
                    });
                }
                self.is_direct = true;
            }
            "listen" => self.listen = Some(parse_endpoint(line, value)?),
            "connect" => self.connect = Some(parse_endpoint(line, value)?),
            "acceptRcvBuf" => self.accept_rcvbuf = Some(parse_buffer_size(line, value)?),
            "acceptSndBuf" => self.accept_sndbuf = Some(parse_buffer_size(line, value)?),
            "peerRcvBuf" => self.peer_rcvbuf = Some(parse_buffer_size(line, value)?),
            "peerSndBuf" => self.peer_sndbuf = Some(parse_buffer_size(line, value)?),
            // unknown keys are ignored for forward compatibility
            _ => {}
        }
        Ok(())
    }

    fn finish(self, services: &mut Vec<ServiceConfig>) -> Result<(), ConfigError> {
        // entries without a service type are skipped, not rejected
        if !self.is_direct {
            return Ok(());
        }
        let listen = self.listen.ok_or_else(|| ConfigError::MissingEndpoint {
            name: self.name.clone(),
            field: "listen",
        })?;
        let connect = self.connect.ok_or_else(|| ConfigError::MissingEndpoint {
            name: self.name.clone(),
            field: "connect",
        })?;
        services.push(ServiceConfig {
            name: self.name,
            listen,
            connect,
            accept_rcvbuf: self.accept_rcvbuf,
            accept_sndbuf: self.accept_sndbuf,
            peer_rcvbuf: self.peer_rcvbuf,
            peer_sndbuf: self.peer_sndbuf,
        });
        Ok(())
    }
}

fn parse_endpoint(line: usize, value: &str) -> Result<EndpointConfig, ConfigError> {
    let invalid = || ConfigError::InvalidEndpoint {
        line,
        value: value.to_string(),
    };

    let (scheme, rest) = value.split_once("://").ok_or_else(invalid)?;
    let scheme = match scheme {
        "tcp" | "tcp4" => Scheme::Tcp4,
        "vsock" => Scheme::Vsock,
        _ => return Err(invalid()),
    };

    let (address, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
    if address.is_empty() {
        return Err(invalid());
    }
    let port = port.parse().map_err(|_| ConfigError::InvalidPort {
        line,
        value: value.to_string(),
    })?;

    Ok(EndpointConfig {
        scheme,
        address: address.to_string(),
        port,
    })
}

fn parse_buffer_size(line: usize, value: &str) -> Result<usize, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidBufferSize {
        line,
        value: value.to_string(),
    })
}
