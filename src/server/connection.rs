//! Per-connection read loop and request dispatch.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::registry::Registration;
use super::ServerShared;
use crate::errno;
use crate::error::{Result, RpcError};
use crate::marshal::{Marshal, TypeRegistry};
use crate::protocol::{Frame, FrameBuffer};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Read buffer size per connection.
const READ_BUFFER_SIZE: usize = 64 * 1024;

struct ConnectionGuard(Arc<ServerShared>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Serve one accepted connection until the peer disconnects, the stream
/// breaks framing, or the server stops.
pub(super) async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    shared.connections.fetch_add(1, Ordering::AcqRel);
    let _guard = ConnectionGuard(shared.clone());

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let (reader, write_half) = stream.into_split();
    let (writer, writer_task) = spawn_writer_task(write_half, shared.config.writer_config());

    tokio::select! {
        result = read_loop(reader, &shared, &writer) => match result {
            Ok(()) => tracing::debug!("Client {} disconnected", peer),
            Err(e) => tracing::warn!("Dropping connection from {}: {}", peer, e),
        },
        _ = shutdown.changed() => {
            tracing::debug!("Closing connection from {} on server stop", peer);
            writer_task.abort();
        }
    }
}

async fn read_loop<R>(mut reader: R, shared: &Arc<ServerShared>, writer: &WriterHandle) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(shared.config.max_payload_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(RpcError::Io(e)),
        };

        for frame in frame_buffer.push(&buf[..n])? {
            dispatch_frame(frame, shared, writer).await?;
        }
    }
}

/// Dispatch a single request.
///
/// Unknown call IDs are answered inline. Known ones wait for a handler slot
/// and run on the blocking pool, so a slow handler never stalls the read
/// loop of its own or any other connection.
async fn dispatch_frame(frame: Frame, shared: &Arc<ServerShared>, writer: &WriterHandle) -> Result<()> {
    let xid = frame.xid();
    let call_id = frame.call_id();

    let registration = shared.funcs.read().get(call_id);
    let registration = match registration {
        Some(r) => r,
        None => {
            tracing::warn!("{} (xid {})", RpcError::UnknownCall(call_id), xid);
            return writer
                .send(OutboundFrame::error_reply(xid, errno::ENOENT))
                .await;
        }
    };

    let permit = shared
        .semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| RpcError::ConnectionClosed)?;

    let writer = writer.clone();
    let types = shared.registry.clone();
    let max_payload = shared.config.max_payload_size;

    tokio::spawn(async move {
        let _permit = permit;
        let label = registration.label();

        let reply = match tokio::task::spawn_blocking(move || {
            run_handler(&registration, &types, xid, frame.payload, max_payload)
        })
        .await
        {
            Ok(reply) => reply,
            Err(e) => {
                let err = RpcError::Handler(format!("panicked: {}", e));
                tracing::error!("Call {} failed (xid {}): {}", label, xid, err);
                OutboundFrame::error_reply(xid, err.error_code())
            }
        };

        if let Err(e) = writer.send(reply).await {
            tracing::debug!("Dropping reply for xid {}: {}", xid, e);
        }
    });

    Ok(())
}

/// Decode arguments, invoke the handler and encode its results.
fn run_handler(
    registration: &Registration,
    types: &TypeRegistry,
    xid: i64,
    payload: Bytes,
    max_payload: u32,
) -> OutboundFrame {
    let mut args = Marshal::from_bytes(&payload);
    let decoded = args.read_values(&registration.arg_types, types);
    let values = match decoded {
        Ok(values) if args.is_empty() => values,
        Ok(_) => {
            tracing::warn!(
                "Call {} (xid {}) has {} trailing argument byte(s)",
                registration.label(),
                xid,
                args.len()
            );
            return OutboundFrame::error_reply(xid, errno::EINVAL);
        }
        Err(e) => {
            tracing::warn!(
                "Call {} (xid {}) arguments failed to decode: {}",
                registration.label(),
                xid,
                e
            );
            return OutboundFrame::error_reply(xid, errno::EINVAL);
        }
    };

    let results = match registration.handler.call(values) {
        Ok(results) => results,
        Err(e) => {
            let err = RpcError::from(e);
            tracing::error!("Call {} failed (xid {}): {}", registration.label(), xid, err);
            return OutboundFrame::error_reply(xid, err.error_code());
        }
    };

    let mut out = Marshal::new();
    if let Err(e) = out.write_values(&results, &registration.result_types, types) {
        tracing::error!(
            "Handler for call {} returned results that do not match its signature: {}",
            registration.label(),
            e
        );
        return OutboundFrame::error_reply(xid, errno::EREMOTEIO);
    }
    if out.len() > max_payload as usize {
        tracing::error!(
            "Reply for call {} is {} bytes, over the {} byte limit",
            registration.label(),
            out.len(),
            max_payload
        );
        return OutboundFrame::error_reply(xid, errno::EREMOTEIO);
    }

    OutboundFrame::reply(xid, errno::OK, out.freeze())
}
