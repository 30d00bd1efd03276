use crate::error::{Error, Result};
use crate::proto::Body;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

const UNIX_PREFIX: &str = "unix:";

/// Listen or connect address.
///
/// Written as `host:port` or `unix:/path/to/socket`. Address files hold the JSON form:
/// `["host", port]` or `"/path/to/socket"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Address {
    Tcp(String, u16),
    Unix(PathBuf),
}

impl Default for Address {
    fn default() -> Self {
        Address::Tcp("127.0.0.1".to_string(), 0)
    }
}

impl Address {
    /// Address report sent to whoever waits for this listener.
    pub fn to_init(&self) -> Body {
        match self {
            Address::Tcp(host, port) => Body::Init {
                host: Some(host.clone()),
                port: Some(*port),
                path: None,
            },
            Address::Unix(path) => Body::Init {
                host: None,
                port: None,
                path: Some(path.display().to_string()),
            },
        }
    }

    /// Inverse of [`Address::to_init`].
    pub fn from_init(body: &Body) -> Option<Self> {
        match body {
            Body::Init {
                host: Some(host),
                port: Some(port),
                ..
            } => Some(Address::Tcp(host.clone(), *port)),
            Body::Init {
                path: Some(path), ..
            } => Some(Address::Unix(PathBuf::from(path))),
            _ => None,
        }
    }

    /// Address of the same kind for an additional listener: a system chosen port, or a socket
    /// file next to this one tagged with `tag`.
    pub fn sibling(&self, tag: &str) -> Self {
        match self {
            Address::Tcp(host, _) => Address::Tcp(host.clone(), 0),
            Address::Unix(path) => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "relay".to_string());
                Address::Unix(path.with_file_name(format!("{stem}-{tag}.sock")))
            }
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Tcp(host, port) if host.contains(':') => write!(f, "[{host}]:{port}"),
            Address::Tcp(host, port) => write!(f, "{host}:{port}"),
            Address::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(Error::BadAddress(format!("empty socket path in `{s}`")));
            }
            return Ok(Address::Unix(PathBuf::from(path)));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::BadAddress(format!("`{s}`: expect host:port or unix:path")))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::BadAddress(format!("`{s}`: bad port: {e}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { "127.0.0.1" } else { host };
        Ok(Address::Tcp(host.to_string(), port))
    }
}
