//! Connection setup and the reply read loop.

use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::ClientShared;
use crate::errno;
use crate::error::{Result, RpcError};
use crate::protocol::FrameBuffer;

/// Read buffer size per connection.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Resolve `addr` and connect to the first address that accepts.
pub(super) fn connect_tcp(addr: &str, timeout: Duration) -> Result<StdTcpStream> {
    let mut last_err = None;
    for candidate in addr.to_socket_addrs()? {
        match StdTcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_nonblocking(true)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", candidate, e);
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(RpcError::Io(e)),
        None => Err(RpcError::Config(format!(
            "address {} did not resolve",
            addr
        ))),
    }
}

/// Fails every outstanding call when the read loop ends, however it ends
/// (EOF, error, abort, or runtime shutdown).
struct DisconnectOnDrop(Arc<ClientShared>);

impl Drop for DisconnectOnDrop {
    fn drop(&mut self) {
        self.0.disconnect(errno::ECONNRESET);
    }
}

/// Read replies and hand each to its pending call.
pub(super) async fn read_loop<R>(mut reader: R, shared: Arc<ClientShared>, peer: SocketAddr, max_payload: u32)
where
    R: AsyncRead + Unpin,
{
    let _disconnect = DisconnectOnDrop(shared.clone());
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::info!("Server {} closed the connection", peer);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Read from {} failed: {}", peer, e);
                return;
            }
        };

        let frames = match frame_buffer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::error!("Dropping connection to {}: {}", peer, e);
                return;
            }
        };
        for frame in frames {
            shared.complete_reply(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let err = connect_tcp(&format!("127.0.0.1:{}", port), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
    }

    #[test]
    fn test_connect_bad_address() {
        assert!(connect_tcp("not an address", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_connect_sets_nodelay() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let stream = connect_tcp(&addr, Duration::from_secs(1)).unwrap();
        assert!(stream.nodelay().unwrap());
    }
}
