//! Client transport abstraction, decoupling the driver from the socket type.
//!
//! Two implementations:
//! - [`SocketConnector`](crate::socket_transport::SocketConnector): kernel TCP or Unix-domain sockets
//! - in-memory connectors used by tests, built on `tokio::io::duplex`
//!
//! A connection is handed out as separate read and write halves so that
//! one task can own response demultiplexing while senders share the
//! write half.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use sheepdog_proto::defaults::DEFAULT_MAX_RESPONSE_SIZE;
use sheepdog_proto::error::{SdError, SdResult};
use sheepdog_proto::request::{SdResponse, SD_HEADER_SIZE};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established connection to a sheep daemon.
pub struct Connection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

/// Opens connections to a sheep daemon.
///
/// The driver asks for a fresh connection on open, for every admin request,
/// and on every reconnect attempt after the data link fails.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Human-readable description of the target for logging.
    fn name(&self) -> String;

    /// Open one new connection.
    async fn connect(&self) -> SdResult<Connection>;
}

/// Send one request and read its response on an exclusive connection.
///
/// At most `max_rlen` bytes of the response payload are read; the rest is
/// left on the connection, which callers discard afterwards.
pub async fn exchange(
    conn: &mut Connection,
    header: &[u8; SD_HEADER_SIZE],
    payload: &[u8],
    max_rlen: usize,
) -> SdResult<(SdResponse, Vec<u8>)> {
    let mut frame = Vec::with_capacity(SD_HEADER_SIZE + payload.len());
    frame.extend_from_slice(header);
    frame.extend_from_slice(payload);
    conn.writer
        .write_all(&frame)
        .await
        .map_err(|_| SdError::NetworkError)?;
    conn.writer.flush().await.map_err(|_| SdError::NetworkError)?;

    let mut hdr = [0u8; SD_HEADER_SIZE];
    conn.reader
        .read_exact(&mut hdr)
        .await
        .map_err(|_| SdError::NetworkError)?;
    let rsp = SdResponse::from_bytes(&hdr);

    let rlen = (rsp.data_length as usize).min(max_rlen);
    if rlen > DEFAULT_MAX_RESPONSE_SIZE {
        return Err(SdError::InvalidParms);
    }
    let mut data = vec![0u8; rlen];
    conn.reader
        .read_exact(&mut data)
        .await
        .map_err(|_| SdError::NetworkError)?;

    debug!(
        "exchange op {:#x} id {} -> result {:#x}, {} bytes",
        header[1], rsp.id, rsp.result, rlen
    );
    Ok((rsp, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheepdog_proto::request::{ObjRequest, Opcode, SD_FLAG_CMD_WRITE};
    use sheepdog_proto::ObjectId;

    #[tokio::test]
    async fn test_exchange_reads_bounded_payload() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(client);
        let mut conn = Connection {
            reader: Box::new(r),
            writer: Box::new(w),
        };

        let server_task = tokio::spawn(async move {
            let mut hdr = [0u8; SD_HEADER_SIZE];
            server.read_exact(&mut hdr).await.unwrap();
            let req = ObjRequest::from_bytes(&hdr);
            let mut payload = vec![0u8; req.hdr.data_length as usize];
            server.read_exact(&mut payload).await.unwrap();
            assert_eq!(payload, b"ping");

            let mut rsp = SdResponse::new(Opcode::WriteObj, req.hdr.id, Ok(()));
            rsp.data_length = 8;
            server.write_all(&rsp.to_bytes()).await.unwrap();
            server.write_all(b"abcdefgh").await.unwrap();
        });

        let mut req = ObjRequest::new(Opcode::WriteObj, ObjectId::from_vid_data(1, 0));
        req.hdr.flags = SD_FLAG_CMD_WRITE;
        req.hdr.id = 77;
        req.hdr.data_length = 4;
        let (rsp, data) = exchange(&mut conn, &req.to_bytes(), b"ping", 5).await.unwrap();
        assert_eq!(rsp.id, 77);
        assert!(rsp.check().is_ok());
        assert_eq!(data, b"abcde");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_reports_closed_connection() {
        let (client, server) = tokio::io::duplex(4096);
        drop(server);
        let (r, w) = tokio::io::split(client);
        let mut conn = Connection {
            reader: Box::new(r),
            writer: Box::new(w),
        };
        let req = ObjRequest::new(Opcode::ReadObj, ObjectId::from_vid(1));
        let err = exchange(&mut conn, &req.to_bytes(), &[], 0).await.unwrap_err();
        assert_eq!(err, SdError::NetworkError);
    }
}
