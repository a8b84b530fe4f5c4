//! Socket-based client transport over kernel TCP or Unix-domain sockets.
//!
//! The transport is selected by the [`HostSpec`]: `host:port` opens a TCP
//! connection with `TCP_NODELAY`, a path opens a Unix-domain socket.

use async_trait::async_trait;
use tracing::debug;

use sheepdog_proto::error::SdResult;

use crate::net::{connect_to, connect_to_unix, HostSpec};
use crate::transport::{Connection, Connector};

/// Connects to one sheep daemon over TCP or a Unix-domain socket.
#[derive(Debug, Clone)]
pub struct SocketConnector {
    spec: HostSpec,
}

impl SocketConnector {
    pub fn new(spec: HostSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }
}

#[async_trait]
impl Connector for SocketConnector {
    fn name(&self) -> String {
        self.spec.to_string()
    }

    async fn connect(&self) -> SdResult<Connection> {
        let conn = match &self.spec {
            HostSpec::Tcp { host, port } => {
                let (r, w) = connect_to(host, *port).await?.into_split();
                Connection {
                    reader: Box::new(r),
                    writer: Box::new(w),
                }
            }
            HostSpec::Unix(path) => {
                let (r, w) = connect_to_unix(path).await?.into_split();
                Connection {
                    reader: Box::new(r),
                    writer: Box::new(w),
                }
            }
        };
        debug!("connected to {}", self.spec);
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheepdog_proto::request::{Opcode, SdResponse, VdiRequest, SD_HEADER_SIZE};
    use sheepdog_proto::SdError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::transport::exchange;

    async fn answer_one<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(mut s: S) {
        let mut hdr = [0u8; SD_HEADER_SIZE];
        s.read_exact(&mut hdr).await.unwrap();
        let req = VdiRequest::from_bytes(&hdr);
        let rsp = SdResponse::new(Opcode::GetVdiInfo, req.hdr.id, Ok(())).with_vdi_id(0x99);
        s.write_all(&rsp.to_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connect_and_exchange() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            answer_one(stream).await;
        });

        let connector = SocketConnector::new(HostSpec::Tcp {
            host: "127.0.0.1".into(),
            port,
        });
        assert_eq!(connector.name(), format!("127.0.0.1:{}", port));
        let mut conn = connector.connect().await.unwrap();
        let req = VdiRequest::new(Opcode::GetVdiInfo);
        let (rsp, _) = exchange(&mut conn, &req.to_bytes(), &[], 0).await.unwrap();
        assert_eq!(rsp.vdi_id(), 0x99);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unix_connect_and_exchange() {
        let path = std::env::temp_dir().join(format!("sdblk-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            answer_one(stream).await;
        });

        let connector = SocketConnector::new(HostSpec::Unix(path.clone()));
        let mut conn = connector.connect().await.unwrap();
        let req = VdiRequest::new(Opcode::GetVdiInfo);
        let (rsp, _) = exchange(&mut conn, &req.to_bytes(), &[], 0).await.unwrap();
        assert_eq!(rsp.vdi_id(), 0x99);
        server.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let connector = SocketConnector::new(HostSpec::Tcp {
            host: "127.0.0.1".into(),
            port,
        });
        assert_eq!(connector.connect().await.err(), Some(SdError::NetworkError));
    }
}
