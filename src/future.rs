//! Handles to in-flight calls.
//!
//! A [`Future`] is created by [`Client::async_call`](crate::Client::async_call)
//! and resolves exactly once, with the reply's error code and payload, when
//! the poll manager matches the reply's xid (or when the call fails locally).
//! It is a blocking handle for plain threads, not a `std::future::Future`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::errno;
use crate::error::{Result, RpcError};
use crate::marshal::{Marshal, TypeDesc, TypeRegistry, Value};

/// Outcome of a call: an error code and, on success, the decoded results.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    /// `0` on success, otherwise one of the [`errno`] codes.
    pub error_code: i32,
    /// Decoded results, in declared order; empty whenever `error_code != 0`.
    pub results: Vec<Value>,
}

impl CallResult {
    /// A successful result.
    pub fn ok(results: Vec<Value>) -> Self {
        Self {
            error_code: errno::OK,
            results,
        }
    }

    /// A failed result with no values.
    pub fn err(error_code: i32) -> Self {
        Self {
            error_code,
            results: Vec::new(),
        }
    }

    /// Check if the call succeeded.
    pub fn is_ok(&self) -> bool {
        self.error_code == errno::OK
    }

    /// Human-readable rendering of the error code.
    pub fn error_message(&self) -> String {
        errno::describe(self.error_code)
    }
}

#[derive(Debug, Default)]
struct Slot {
    resolved: bool,
    error_code: i32,
    reply: Option<Bytes>,
    reply_taken: bool,
}

/// Resolution state shared by a [`Future`], the pending-call table and the
/// delivery thread.
pub(crate) struct FutureState {
    xid: i64,
    slot: Mutex<Slot>,
    resolved: Condvar,
    result_types: Arc<[TypeDesc]>,
    registry: Arc<TypeRegistry>,
}

impl FutureState {
    pub(crate) fn new(xid: i64, result_types: Arc<[TypeDesc]>, registry: Arc<TypeRegistry>) -> Self {
        Self {
            xid,
            slot: Mutex::new(Slot::default()),
            resolved: Condvar::new(),
            result_types,
            registry,
        }
    }

    pub(crate) fn xid(&self) -> i64 {
        self.xid
    }

    /// Store the outcome and wake all waiters. The first resolution wins;
    /// returns `false` if the state was already resolved.
    ///
    /// An empty reply payload is stored as no reply.
    pub(crate) fn resolve(&self, error_code: i32, reply: Option<Bytes>) -> bool {
        let mut slot = self.slot.lock();
        if slot.resolved {
            return false;
        }
        slot.resolved = true;
        slot.error_code = error_code;
        slot.reply = reply.filter(|r| !r.is_empty());
        drop(slot);

        self.resolved.notify_all();
        true
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.slot.lock().resolved
    }

    pub(crate) fn wait(&self) {
        let mut slot = self.slot.lock();
        while !slot.resolved {
            self.resolved.wait(&mut slot);
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while !slot.resolved {
            if self.resolved.wait_until(&mut slot, deadline).timed_out() {
                return slot.resolved;
            }
        }
        true
    }

    /// Decode the reply against the declared result types.
    ///
    /// Reads a shared view of the payload, so it is unaffected by
    /// [`Future::take_reply`]. Must only be called once resolved.
    pub(crate) fn result(&self) -> CallResult {
        let (error_code, reply) = {
            let slot = self.slot.lock();
            (slot.error_code, slot.reply.clone())
        };
        decode_results(
            self.xid,
            error_code,
            reply,
            &self.result_types,
            &self.registry,
        )
    }
}

/// Decode a resolved reply. Strict: missing or trailing bytes fail the call
/// with `EBADMSG`.
fn decode_results(
    xid: i64,
    error_code: i32,
    reply: Option<Bytes>,
    types: &[TypeDesc],
    registry: &TypeRegistry,
) -> CallResult {
    if error_code != errno::OK {
        return CallResult::err(error_code);
    }

    let reply = match reply {
        Some(reply) => reply,
        None if types.is_empty() => return CallResult::ok(Vec::new()),
        None => {
            tracing::warn!("Call {} expected {} result(s), got no reply", xid, types.len());
            return CallResult::err(errno::EBADMSG);
        }
    };

    let mut m = Marshal::from_bytes(&reply);
    match m.read_values(types, registry) {
        Ok(values) if m.is_empty() => CallResult::ok(values),
        Ok(_) => {
            tracing::warn!("Call {} reply has {} trailing byte(s)", xid, m.len());
            CallResult::err(errno::EBADMSG)
        }
        Err(e) => {
            tracing::warn!("Call {} reply failed to decode: {}", xid, e);
            CallResult::err(errno::EBADMSG)
        }
    }
}

/// Handle to an asynchronous call.
///
/// Dropping the handle releases it; an unresolved call still completes in
/// the background and its callback, if any, still runs.
pub struct Future {
    state: Arc<FutureState>,
}

impl Future {
    pub(crate) fn new(state: Arc<FutureState>) -> Self {
        Self { state }
    }

    /// Transaction ID of the call.
    pub fn xid(&self) -> i64 {
        self.state.xid()
    }

    /// Check, without blocking, if the call has resolved.
    pub fn ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Block until the call resolves.
    pub fn wait(&self) {
        self.state.wait()
    }

    /// Block until the call resolves or `timeout` elapses. Returns whether
    /// the call resolved.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.state.wait_timeout(timeout)
    }

    /// Error code, or `None` while pending.
    pub fn error_code(&self) -> Option<i32> {
        let slot = self.state.slot.lock();
        slot.resolved.then_some(slot.error_code)
    }

    /// Wait for resolution and take the raw reply payload.
    ///
    /// The reply can be taken once. Returns `Ok(None)` for a call answered
    /// without a payload (including every failed call).
    ///
    /// # Errors
    ///
    /// `RpcError::ReplyTaken` if the reply was already taken.
    pub fn take_reply(&self) -> Result<Option<Marshal>> {
        self.wait();
        let mut slot = self.state.slot.lock();
        if slot.reply_taken {
            return Err(RpcError::ReplyTaken);
        }
        slot.reply_taken = true;
        Ok(slot.reply.as_ref().map(|r| Marshal::from_bytes(r)))
    }

    /// Wait for resolution and decode the results.
    ///
    /// # Errors
    ///
    /// `RpcError::ReplyTaken` if [`take_reply`](Self::take_reply) ran first.
    pub fn into_result(self) -> Result<CallResult> {
        self.state.wait();
        if self.state.slot.lock().reply_taken {
            return Err(RpcError::ReplyTaken);
        }
        Ok(self.state.result())
    }

    /// Release the handle without waiting.
    pub fn release(self) {}
}

impl std::fmt::Debug for Future {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("xid", &self.xid())
            .field("ready", &self.ready())
            .finish()
    }
}
