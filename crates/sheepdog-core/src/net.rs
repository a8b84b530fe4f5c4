//! Async TCP/Unix socket I/O for sheepdog.

use std::fmt;
use std::path::PathBuf;

use sheepdog_proto::constants::{SD_DEFAULT_ADDR, SD_LISTEN_PORT};
use sheepdog_proto::{SdError, SdResult};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, error};

/// Where a sheep daemon accepts client connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostSpec {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Default for HostSpec {
    fn default() -> Self {
        HostSpec::Tcp {
            host: SD_DEFAULT_ADDR.to_string(),
            port: SD_LISTEN_PORT,
        }
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostSpec::Tcp { host, port } => write!(f, "{}:{}", host, port),
            HostSpec::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Connect to a remote sheepdog node by address and port.
pub async fn connect_to(addr: &str, port: u16) -> SdResult<TcpStream> {
    let target = format!("{}:{}", addr, port);
    debug!("connecting to {}", target);

    let stream = TcpStream::connect(&target).await.map_err(|e| {
        error!("failed to connect to {}: {}", target, e);
        SdError::NetworkError
    })?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Connect to a sheep daemon listening on a Unix-domain socket.
pub async fn connect_to_unix(path: &std::path::Path) -> SdResult<UnixStream> {
    debug!("connecting to {}", path.display());
    UnixStream::connect(path).await.map_err(|e| {
        error!("failed to connect to {}: {}", path.display(), e);
        SdError::NetworkError
    })
}
