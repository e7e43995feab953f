//! Background callback delivery.
//!
//! Each client owns one delivery thread. The I/O side never runs user code:
//! when a call with a callback resolves, it queues a [`Completion`] pairing
//! the callback ID with the call's state, and the delivery thread decodes the
//! results and runs the callback. Callbacks therefore run one at a time, in
//! the order their replies were read.
//!
//! Stopping is a death pill: [`Delivery::shutdown`] raises a stop flag and
//! queues [`Completion::Shutdown`]. The thread exits as soon as it sees
//! either, so completions still queued are discarded, not delivered.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::future::{CallResult, FutureState};

/// Callback ID meaning "no callback".
pub(crate) const NO_CALLBACK: u64 = 0;

/// Name of the delivery thread.
const THREAD_NAME: &str = "wirecall-delivery";

/// A continuation run with a call's outcome.
pub(crate) type DoneCallback = Box<dyn FnOnce(CallResult) + Send + 'static>;

/// Queue entry consumed by the delivery thread.
pub(crate) enum Completion {
    /// A call with a callback has resolved.
    Done {
        callback_id: u64,
        state: Arc<FutureState>,
    },
    /// Death pill.
    Shutdown,
}

/// Callback-ID to continuation map.
///
/// Inserted into by calling threads and drained by the delivery thread; the
/// lock is held for the map operation only, never across a callback.
pub(crate) struct CallbackTable {
    callbacks: Mutex<HashMap<u64, DoneCallback>>,
    next_id: AtomicU64,
}

impl CallbackTable {
    pub(crate) fn new() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(NO_CALLBACK + 1),
        }
    }

    pub(crate) fn register(&self, callback: DoneCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().insert(id, callback);
        id
    }

    pub(crate) fn take(&self, id: u64) -> Option<DoneCallback> {
        self.callbacks.lock().remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Drop every registered callback uninvoked.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<DoneCallback> = self.callbacks.lock().drain().map(|(_, cb)| cb).collect();
        drained.len()
    }
}

/// Handle to a client's delivery thread.
pub(crate) struct Delivery {
    tx: mpsc::UnboundedSender<Completion>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Delivery {
    /// Spawn the delivery thread.
    pub(crate) fn spawn(callbacks: Arc<CallbackTable>) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(rx, &callbacks, &thread_stop))?;

        Ok(Self {
            tx,
            stop,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Queue a resolved call for delivery. Returns `false` once the thread
    /// has stopped.
    pub(crate) fn notify(&self, callback_id: u64, state: Arc<FutureState>) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return false;
        }
        self.tx
            .send(Completion::Done { callback_id, state })
            .is_ok()
    }

    /// Send the death pill and join the thread. Idempotent.
    ///
    /// Called from a callback running on the delivery thread itself, the
    /// join is skipped; the thread exits once that callback returns.
    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.tx.send(Completion::Shutdown);

        if thread::current().id() == self.thread_id {
            return;
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Delivery thread panicked");
            }
        }
    }
}

/// Delivery loop: pop, look up, invoke outside the lock, until the pill.
fn run(mut rx: mpsc::UnboundedReceiver<Completion>, callbacks: &CallbackTable, stop: &AtomicBool) {
    tracing::trace!("Delivery thread started");
    let mut discarded = 0usize;

    while let Some(completion) = rx.blocking_recv() {
        let (callback_id, state) = match completion {
            Completion::Shutdown => break,
            Completion::Done { callback_id, state } => (callback_id, state),
        };
        if stop.load(Ordering::Acquire) {
            discarded += 1;
            break;
        }

        let callback = match callbacks.take(callback_id) {
            Some(cb) => cb,
            None => {
                tracing::warn!("No callback {} for call {}", callback_id, state.xid());
                continue;
            }
        };

        let result = state.result();
        if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
            tracing::error!("Callback for call {} panicked", state.xid());
        }
    }

    rx.close();
    while let Ok(completion) = rx.try_recv() {
        if matches!(completion, Completion::Done { .. }) {
            discarded += 1;
        }
    }
    if discarded > 0 {
        tracing::debug!("Delivery thread discarded {} completion(s)", discarded);
    }
    tracing::trace!("Delivery thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno;
    use crate::marshal::{TypeDesc, TypeRegistry};
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn resolved(xid: i64, code: i32) -> Arc<FutureState> {
        let state = Arc::new(FutureState::new(
            xid,
            Vec::<TypeDesc>::new().into(),
            Arc::new(TypeRegistry::new()),
        ));
        state.resolve(code, None);
        state
    }

    fn recording(log: &std_mpsc::Sender<(i64, i32)>, xid: i64) -> DoneCallback {
        let log = log.clone();
        Box::new(move |result: CallResult| {
            let _ = log.send((xid, result.error_code));
        })
    }

    #[test]
    fn test_callback_ids_skip_sentinel() {
        let table = CallbackTable::new();
        let id = table.register(Box::new(|_| {}));
        assert_ne!(id, NO_CALLBACK);
        assert_eq!(table.len(), 1);
        assert!(table.take(id).is_some());
        assert!(table.take(id).is_none());
    }

    #[test]
    fn test_delivers_in_queue_order() {
        let callbacks = Arc::new(CallbackTable::new());
        let delivery = Delivery::spawn(callbacks.clone()).unwrap();
        let (log, seen) = std_mpsc::channel();

        for (xid, code) in [(2, errno::OK), (1, errno::ENOENT), (3, errno::OK)] {
            let id = callbacks.register(recording(&log, xid));
            assert!(delivery.notify(id, resolved(xid, code)));
        }

        let got: Vec<_> = (0..3)
            .map(|_| seen.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![(2, 0), (1, errno::ENOENT), (3, 0)]);
        assert_eq!(callbacks.len(), 0);

        delivery.shutdown();
    }

    #[test]
    fn test_death_pill_discards_queued_completions() {
        let callbacks = Arc::new(CallbackTable::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = AtomicBool::new(false);
        let (log, seen) = std_mpsc::channel();

        // Three completions already queued when the pill arrives.
        for xid in 1..=3 {
            let id = callbacks.register(recording(&log, xid));
            tx.send(Completion::Done {
                callback_id: id,
                state: resolved(xid, errno::OK),
            })
            .ok()
            .unwrap();
        }
        stop.store(true, Ordering::Release);
        tx.send(Completion::Shutdown).ok().unwrap();

        run(rx, &callbacks, &stop);

        assert!(seen.try_recv().is_err());
        assert_eq!(callbacks.len(), 3);
        assert!(tx.is_closed());
    }

    #[test]
    fn test_pill_without_backlog_exits() {
        let callbacks = Arc::new(CallbackTable::new());
        let delivery = Delivery::spawn(callbacks).unwrap();

        delivery.shutdown();
        delivery.shutdown();
        assert!(!delivery.notify(1, resolved(1, errno::OK)));
    }

    #[test]
    fn test_panicking_callback_keeps_thread_alive() {
        let callbacks = Arc::new(CallbackTable::new());
        let delivery = Delivery::spawn(callbacks.clone()).unwrap();
        let (log, seen) = std_mpsc::channel();

        let bad = callbacks.register(Box::new(|_| panic!("callback failure")));
        delivery.notify(bad, resolved(1, errno::OK));
        let good = callbacks.register(recording(&log, 2));
        delivery.notify(good, resolved(2, errno::OK));

        assert_eq!(seen.recv_timeout(Duration::from_secs(5)).unwrap(), (2, 0));
        delivery.shutdown();
    }

    #[test]
    fn test_shutdown_from_callback_does_not_deadlock() {
        let callbacks = Arc::new(CallbackTable::new());
        let delivery = Arc::new(Delivery::spawn(callbacks.clone()).unwrap());
        let (log, seen) = std_mpsc::channel();

        let inner = delivery.clone();
        let id = callbacks.register(Box::new(move |_| {
            inner.shutdown();
            let _ = log.send((0, 0));
        }));
        delivery.notify(id, resolved(1, errno::OK));

        assert!(seen.recv_timeout(Duration::from_secs(5)).is_ok());
        delivery.shutdown();
    }

    #[test]
    fn test_clear_drops_callbacks() {
        let table = CallbackTable::new();
        table.register(Box::new(|_| {}));
        table.register(Box::new(|_| {}));
        assert_eq!(table.clear(), 2);
        assert_eq!(table.len(), 0);
    }
}
