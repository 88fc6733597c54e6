//! Addresses and dialing for the duplex byte stream under an `RpcStream`.
//!
//! An address is either `host:port` (TCP) or a filesystem path (Unix
//! domain socket), matching how the editor advertises its listen address.

use crate::config::RpcConfig;
use crate::{Result, RpcError};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Read half of a connected stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connected stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where to reach an RPC peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Address {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Address::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Address::Unix(path.into())
    }

    /// Read the address from `NVIM_LISTEN_ADDRESS`.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(RpcConfig::LISTEN_ADDRESS_ENV).map_err(|_| {
            RpcError::InvalidAddress(format!("{} is not set", RpcConfig::LISTEN_ADDRESS_ENV))
        })?;
        raw.parse()
    }

    /// Dial the address and split the connection into boxed halves.
    pub async fn connect(&self) -> Result<(BoxedReader, BoxedWriter)> {
        let halves = tokio::time::timeout(RpcConfig::CONNECT_TIMEOUT, self.dial())
            .await
            .map_err(|_| RpcError::ConnectionClosed {
                reason: format!(
                    "timed out connecting to {} after {:?}",
                    self,
                    RpcConfig::CONNECT_TIMEOUT
                ),
            })??;
        debug!("Connected to {}", self);
        Ok(halves)
    }

    async fn dial(&self) -> Result<(BoxedReader, BoxedWriter)> {
        match self {
            Address::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| connect_error(self, e))?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            #[cfg(unix)]
            Address::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| connect_error(self, e))?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            #[cfg(not(unix))]
            Address::Unix(path) => Err(RpcError::InvalidAddress(format!(
                "Unix sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }
}

fn connect_error(address: &Address, err: std::io::Error) -> RpcError {
    RpcError::ConnectionClosed {
        reason: format!("failed to connect to {}: {}", address, err),
    }
}

impl FromStr for Address {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RpcError::InvalidAddress("empty address".to_string()));
        }

        // Anything that looks like a path is a socket, even if it contains ':'
        if s.starts_with('/') || s.starts_with('.') || s.starts_with('\\') {
            return Ok(Address::Unix(PathBuf::from(s)));
        }

        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| RpcError::InvalidAddress(format!("invalid port in {}", s)))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(RpcError::InvalidAddress(format!("missing host in {}", s)));
                }
                Ok(Address::tcp(host, port))
            }
            None => Ok(Address::Unix(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Address::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Address::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<std::net::SocketAddr> for Address {
    fn from(addr: std::net::SocketAddr) -> Self {
        Address::tcp(addr.ip().to_string(), addr.port())
    }
}
