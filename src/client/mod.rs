//! Client builder and call API.
//!
//! A [`Client`] owns one TCP connection. Its read loop runs on a
//! [`PollManager`]; calling threads block on per-call futures and user
//! callbacks run on the client's own delivery thread.
//!
//! # Example
//!
//! ```no_run
//! use wirecall::marshal::{TypeDesc, Value};
//! use wirecall::{Client, PollManager};
//!
//! fn main() -> wirecall::Result<()> {
//!     let poll = PollManager::new()?;
//!     let client = Client::connect(&poll, "127.0.0.1:8848")?;
//!
//!     let ints = [TypeDesc::I32, TypeDesc::I32];
//!     let result = client.sync_call(1987, &[Value::I32(3), Value::I32(4)], &ints, &[TypeDesc::I32])?;
//!     assert_eq!(result.results, vec![Value::I32(7)]);
//!
//!     client.async_call_with_callback(1987, &[Value::I32(1), Value::I32(2)], &ints, &[TypeDesc::I32], |r| {
//!         println!("1 + 2 -> {:?} ({})", r.results, r.error_message());
//!     })?;
//!
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! Blocking calls must not be made from inside an async task.

mod connection;
mod delivery;
mod pool;

pub use pool::ClientPool;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::errno;
use crate::error::{Result, RpcError};
use crate::future::{CallResult, Future, FutureState};
use crate::marshal::{Marshal, TypeDesc, TypeRegistry, Value};
use crate::poll::PollManager;
use crate::protocol::Frame;
use crate::service::Signature;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};
use delivery::{CallbackTable, Delivery, DoneCallback, NO_CALLBACK};

/// Builder for configuring and connecting a client.
#[derive(Default)]
pub struct ClientBuilder {
    registry: Arc<TypeRegistry>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Struct layouts used to encode arguments and decode results.
    pub fn registry(mut self, registry: impl Into<Arc<TypeRegistry>>) -> Self {
        self.registry = registry.into();
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the TCP connect timeout.
    ///
    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the default deadline for [`Client::sync_call`].
    ///
    /// Default: none (wait for the reply or a connection failure)
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the largest accepted payload, in both directions.
    ///
    /// Default: 64 MB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set the maximum queued request frames before callers wait.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.max_pending_frames = limit;
        self
    }

    /// Set how long a caller waits for the request queue to drain.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Connect to `addr` (`"host:port"`).
    ///
    /// # Errors
    ///
    /// `RpcError::Io` if no connection can be established,
    /// `RpcError::Config` if the settings are invalid, the address does not
    /// resolve or the poll manager is shut down.
    pub fn connect(self, poll: &PollManager, addr: &str) -> Result<Client> {
        Client::start(poll, addr, self.registry, self.config)
    }
}

/// Calls issued and not yet resolved.
struct PendingTable {
    calls: HashMap<i64, PendingCall>,
    /// Cleared when the connection goes down; no call is admitted after.
    open: bool,
}

struct PendingCall {
    state: Arc<FutureState>,
    callback_id: u64,
}

/// State shared by the client handle and its read loop.
pub(crate) struct ClientShared {
    registry: Arc<TypeRegistry>,
    peer: SocketAddr,
    pending: Mutex<PendingTable>,
    callbacks: Arc<CallbackTable>,
    delivery: Delivery,
    writer: Mutex<Option<WriterHandle>>,
    next_xid: AtomicI64,
    max_payload: u32,
}

impl ClientShared {
    /// Encode, register and send a call. Only setup failures return `Err`;
    /// a call that cannot be sent resolves locally.
    fn start_call(
        &self,
        call_id: i32,
        args: &[Value],
        arg_types: &[TypeDesc],
        result_types: &[TypeDesc],
        callback: Option<DoneCallback>,
    ) -> Result<Future> {
        self.registry.check_all(arg_types)?;
        self.registry.check_all(result_types)?;

        let mut m = Marshal::new();
        m.write_values(args, arg_types, &self.registry)?;
        if m.len() > self.max_payload as usize {
            return Err(RpcError::Encode(format!(
                "request payload of {} bytes exceeds maximum {}",
                m.len(),
                self.max_payload
            )));
        }

        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(FutureState::new(
            xid,
            result_types.into(),
            self.registry.clone(),
        ));
        let callback_id = match callback {
            Some(cb) => self.callbacks.register(cb),
            None => NO_CALLBACK,
        };
        let future = Future::new(state.clone());
        let call = PendingCall { state, callback_id };

        {
            let mut pending = self.pending.lock();
            if !pending.open {
                drop(pending);
                tracing::debug!("Call {} issued while not connected", xid);
                self.fail_locally(call, errno::ENOTCONN);
                return Ok(future);
            }
            pending.calls.insert(xid, call);
        }

        let writer = self.writer.lock().clone();
        let sent = match writer {
            Some(writer) => writer.send_blocking(OutboundFrame::request(xid, call_id, m.freeze())),
            None => Err(RpcError::NotConnected),
        };

        if let Err(e) = sent {
            // Disconnect may have failed the call already.
            let call = self.pending.lock().calls.remove(&xid);
            if let Some(call) = call {
                tracing::debug!("Call {} could not be sent: {}", xid, e);
                let code = match e {
                    RpcError::BackpressureTimeout => errno::ETIMEDOUT,
                    _ => errno::ENOTCONN,
                };
                self.fail_locally(call, code);
            }
        }

        Ok(future)
    }

    /// Resolve a call on the calling thread, running its callback inline.
    fn fail_locally(&self, call: PendingCall, error_code: i32) {
        call.state.resolve(error_code, None);
        self.run_inline(call.callback_id, &call.state);
    }

    /// Resolve a call from the I/O side, handing its callback to the
    /// delivery thread.
    fn complete(&self, call: PendingCall, error_code: i32, reply: Option<bytes::Bytes>) {
        call.state.resolve(error_code, reply);
        if call.callback_id != NO_CALLBACK
            && !self.delivery.notify(call.callback_id, call.state.clone())
        {
            // Delivery has stopped; the callback still runs exactly once.
            self.run_inline(call.callback_id, &call.state);
        }
    }

    fn run_inline(&self, callback_id: u64, state: &FutureState) {
        if callback_id == NO_CALLBACK {
            return;
        }
        if let Some(callback) = self.callbacks.take(callback_id) {
            let result = state.result();
            if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                tracing::error!("Callback for call {} panicked", state.xid());
            }
        }
    }

    fn complete_reply(&self, frame: Frame) {
        let xid = frame.xid();
        let call = self.pending.lock().calls.remove(&xid);
        match call {
            Some(call) => self.complete(call, frame.error_code(), Some(frame.payload)),
            None => tracing::warn!("Dropping reply for unknown xid {}", xid),
        }
    }

    /// Give up on a call; it resolves with `ETIMEDOUT` unless its reply won
    /// the race.
    fn abandon(&self, xid: i64) {
        let call = self.pending.lock().calls.remove(&xid);
        if let Some(call) = call {
            let err = RpcError::Timeout;
            tracing::debug!("Call {}: {}", xid, err);
            self.complete(call, err.error_code(), None);
        }
    }

    /// Close the connection and fail every outstanding call with `error_code`.
    /// Later calls fail with `ENOTCONN`. Idempotent.
    fn disconnect(&self, error_code: i32) {
        let mut calls: Vec<(i64, PendingCall)> = {
            let mut pending = self.pending.lock();
            pending.open = false;
            pending.calls.drain().collect()
        };
        let writer = self.writer.lock().take();
        if writer.is_some() {
            tracing::info!("Disconnected from {}", self.peer);
        }
        drop(writer);

        if calls.is_empty() {
            return;
        }
        tracing::debug!(
            "Failing {} outstanding call(s) to {}: {}",
            calls.len(),
            self.peer,
            errno::describe(error_code)
        );
        calls.sort_unstable_by_key(|(xid, _)| *xid);
        for (_, call) in calls {
            self.complete(call, error_code, None);
        }
    }
}

/// A connection to one server.
///
/// Safe to share across threads. Dropping the client closes it.
pub struct Client {
    shared: Arc<ClientShared>,
    config: ClientConfig,
    reader_task: JoinHandle<()>,
    closed: AtomicBool,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect with default settings and no struct types.
    pub fn connect(poll: &PollManager, addr: &str) -> Result<Self> {
        ClientBuilder::new().connect(poll, addr)
    }

    fn start(
        poll: &PollManager,
        addr: &str,
        registry: Arc<TypeRegistry>,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let stream = connection::connect_tcp(addr, config.connect_timeout())?;
        let peer = stream.peer_addr()?;

        let (reader, writer) = {
            let _enter = poll.enter()?;
            let stream = tokio::net::TcpStream::from_std(stream)?;
            let (reader, write_half) = stream.into_split();
            let (writer, _writer_task) = spawn_writer_task(write_half, config.writer_config());
            (reader, writer)
        };

        let callbacks = Arc::new(CallbackTable::new());
        let delivery = Delivery::spawn(callbacks.clone())?;

        let shared = Arc::new(ClientShared {
            registry,
            peer,
            pending: Mutex::new(PendingTable {
                calls: HashMap::new(),
                open: true,
            }),
            callbacks,
            delivery,
            writer: Mutex::new(Some(writer)),
            next_xid: AtomicI64::new(1),
            max_payload: config.max_payload_size,
        });

        let reader_task = poll.spawn(connection::read_loop(
            reader,
            shared.clone(),
            peer,
            config.max_payload_size,
        ));

        tracing::info!("Connected to {}", peer);
        Ok(Self {
            shared,
            config,
            reader_task,
            closed: AtomicBool::new(false),
        })
    }

    /// Issue a call without waiting.
    ///
    /// # Errors
    ///
    /// `RpcError::Encode` / `RpcError::Config` if the arguments do not match
    /// `arg_types` or a type is not registered. Every other failure resolves
    /// the returned future with an error code.
    pub fn async_call(
        &self,
        call_id: i32,
        args: &[Value],
        arg_types: &[TypeDesc],
        result_types: &[TypeDesc],
    ) -> Result<Future> {
        self.shared
            .start_call(call_id, args, arg_types, result_types, None)
    }

    /// Issue a call and run `done` with its outcome.
    ///
    /// `done` runs exactly once: on the delivery thread when the reply
    /// arrives, or on the calling thread, before this returns, if the call
    /// fails locally (not connected, queue full). It is dropped uninvoked if
    /// the client closes first.
    pub fn async_call_with_callback<F>(
        &self,
        call_id: i32,
        args: &[Value],
        arg_types: &[TypeDesc],
        result_types: &[TypeDesc],
        done: F,
    ) -> Result<Future>
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        self.shared
            .start_call(call_id, args, arg_types, result_types, Some(Box::new(done)))
    }

    /// Issue a call and block until it resolves, or until the configured
    /// call timeout.
    pub fn sync_call(
        &self,
        call_id: i32,
        args: &[Value],
        arg_types: &[TypeDesc],
        result_types: &[TypeDesc],
    ) -> Result<CallResult> {
        match self.config.call_timeout() {
            Some(timeout) => {
                self.sync_call_timeout(call_id, args, arg_types, result_types, timeout)
            }
            None => self
                .async_call(call_id, args, arg_types, result_types)?
                .into_result(),
        }
    }

    /// Issue a call and block for at most `timeout`; a call still pending
    /// then resolves with `ETIMEDOUT` and a late reply is dropped.
    pub fn sync_call_timeout(
        &self,
        call_id: i32,
        args: &[Value],
        arg_types: &[TypeDesc],
        result_types: &[TypeDesc],
        timeout: Duration,
    ) -> Result<CallResult> {
        let future = self.async_call(call_id, args, arg_types, result_types)?;
        if !future.wait_timeout(timeout) {
            self.shared.abandon(future.xid());
        }
        future.into_result()
    }

    /// [`sync_call`](Self::sync_call) against a signature.
    pub fn call(&self, signature: &Signature, args: &[Value]) -> Result<CallResult> {
        self.sync_call(
            signature.call_id,
            args,
            &signature.arg_types,
            &signature.result_types,
        )
    }

    /// Close the client. Idempotent.
    ///
    /// Stops the delivery thread first: completions already queued for it
    /// are discarded and their callbacks dropped. Every call still waiting
    /// for a reply then resolves with `EBADF`, its callback running on the
    /// closing thread, and the connection is dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.delivery.shutdown();
        self.shared.disconnect(errno::EBADF);
        let dropped = self.shared.callbacks.clear();
        if dropped > 0 {
            tracing::debug!("Dropped {} undelivered callback(s)", dropped);
        }
        self.reader_task.abort();
        tracing::debug!("Client for {} closed", self.shared.peer);
    }

    /// Check if the connection is up and the client is open.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.shared.pending.lock().open
    }

    /// Address of the server.
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Calls issued and not yet resolved.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.lock().calls.len()
    }

    /// Callbacks registered and not yet run.
    pub fn pending_callbacks(&self) -> usize {
        self.shared.callbacks.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.shared.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}
