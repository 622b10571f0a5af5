//! Server address syntax, resolution order, and socket establishment.

use std::env;
use std::path::PathBuf;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::Code;

/// Environment variable naming the server to connect to.
pub const SERVER_ENV: &str = "CADENZA_SERVER";

/// TCP port used when an address does not name one.
pub const DEFAULT_PORT: u16 = 6393;

const RUNTIME_SOCKET_NAME: &str = "cadenza/native";
const SYSTEM_SOCKET_PATH: &str = "/var/run/cadenza/native";

/// The established byte stream under the framer.
pub(crate) type Medium = Box<dyn MediumIo>;

pub(crate) trait MediumIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> MediumIo for T {}

/// Malformed server string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("server address is empty")]
    Empty,
    #[error("server address has an invalid port: {0:?}")]
    BadPort(String),
    #[error("server address has an unterminated bracketed host")]
    UnclosedBracket,
}

/// A parsed server location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    /// UNIX domain socket at an absolute path.
    Unix(PathBuf),
    /// TCP host, resolved family-unspecified at connect time.
    Tcp { host: String, port: u16 },
}

impl ServerAddr {
    /// Parses a server string: a leading `/` selects a UNIX socket;
    /// anything else is `host`, `host:port`, or `[v6addr]:port`.
    pub fn parse(s: &str) -> Result<ServerAddr, AddrError> {
        if s.is_empty() {
            return Err(AddrError::Empty);
        }
        if s.starts_with('/') {
            return Ok(ServerAddr::Unix(PathBuf::from(s)));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or(AddrError::UnclosedBracket)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|_| AddrError::BadPort(p.to_string()))?,
                None => DEFAULT_PORT,
            };
            return Ok(ServerAddr::Tcp {
                host: host.to_string(),
                port,
            });
        }

        match s.rsplit_once(':') {
            // A second colon means a bare IPv6 address, not host:port.
            Some((host, port)) if !host.contains(':') => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AddrError::BadPort(port.to_string()))?;
                Ok(ServerAddr::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Ok(ServerAddr::Tcp {
                host: s.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }

    /// Applies the resolution order: explicit argument, then
    /// `$CADENZA_SERVER`, then the default UNIX socket.
    pub fn resolve(explicit: Option<&str>) -> Result<ServerAddr, AddrError> {
        match pick_server(explicit, env::var(SERVER_ENV).ok().as_deref()) {
            Some(s) => ServerAddr::parse(&s),
            None => Ok(ServerAddr::Unix(default_socket_path())),
        }
    }

    /// Opens the byte stream. Resolution failures map to
    /// [`Code::InvalidServer`]; a peer that won't take the connection
    /// maps to [`Code::ConnectionRefused`].
    pub(crate) async fn open(&self) -> Result<Medium, Code> {
        match self {
            #[cfg(unix)]
            ServerAddr::Unix(path) => {
                debug!(path = %path.display(), "connecting over unix socket");
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|_| Code::ConnectionRefused)?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            ServerAddr::Unix(_) => Err(Code::InvalidServer),
            ServerAddr::Tcp { host, port } => {
                debug!(host = host.as_str(), port, "resolving server host");
                let addrs: Vec<_> = lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|_| Code::InvalidServer)?
                    .collect();
                if addrs.is_empty() {
                    return Err(Code::InvalidServer);
                }
                for addr in addrs {
                    if let Ok(stream) = TcpStream::connect(addr).await {
                        return Ok(Box::new(stream));
                    }
                }
                Err(Code::ConnectionRefused)
            }
        }
    }
}

/// Pure half of the resolution order, kept separate so it can be tested
/// without touching the process environment.
fn pick_server(explicit: Option<&str>, env: Option<&str>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| env.map(str::to_string))
}

/// Default per-user socket: `$XDG_RUNTIME_DIR/cadenza/native`, falling
/// back to the system-wide path.
pub fn default_socket_path() -> PathBuf {
    match env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join(RUNTIME_SOCKET_NAME),
        None => PathBuf::from(SYSTEM_SOCKET_PATH),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_slash_selects_unix() {
        assert_eq!(
            ServerAddr::parse("/run/cadenza/native").unwrap(),
            ServerAddr::Unix(PathBuf::from("/run/cadenza/native"))
        );
    }

    #[test]
    fn bare_host_uses_default_port() {
        assert_eq!(
            ServerAddr::parse("audio.example.org").unwrap(),
            ServerAddr::Tcp {
                host: "audio.example.org".to_string(),
                port: DEFAULT_PORT,
            }
        );
    }

    #[test]
    fn host_port_splits_on_last_colon() {
        assert_eq!(
            ServerAddr::parse("localhost:4000").unwrap(),
            ServerAddr::Tcp {
                host: "localhost".to_string(),
                port: 4000,
            }
        );
    }

    #[test]
    fn bracketed_v6_with_port() {
        assert_eq!(
            ServerAddr::parse("[::1]:4000").unwrap(),
            ServerAddr::Tcp {
                host: "::1".to_string(),
                port: 4000,
            }
        );
    }

    #[test]
    fn bare_v6_keeps_default_port() {
        assert_eq!(
            ServerAddr::parse("fe80::1").unwrap(),
            ServerAddr::Tcp {
                host: "fe80::1".to_string(),
                port: DEFAULT_PORT,
            }
        );
    }

    #[test]
    fn bad_port_is_rejected() {
        assert_eq!(
            ServerAddr::parse("host:notaport"),
            Err(AddrError::BadPort("notaport".to_string()))
        );
    }

    #[test]
    fn empty_address_is_rejected() {
        assert_eq!(ServerAddr::parse(""), Err(AddrError::Empty));
    }

    #[test]
    fn explicit_argument_wins_over_environment() {
        assert_eq!(
            pick_server(Some("/a"), Some("/b")).as_deref(),
            Some("/a")
        );
        assert_eq!(pick_server(None, Some("/b")).as_deref(), Some("/b"));
        assert_eq!(pick_server(None, None), None);
    }
}
