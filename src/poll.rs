//! The poll manager: one I/O runtime shared by every client and server.
//!
//! A [`PollManager`] owns a multi-threaded tokio runtime whose workers drive
//! all socket readiness, frame reassembly and reply correlation. It is an
//! explicit, cloneable handle: create one with [`PollManager::init`], pass it
//! to each [`Client`](crate::Client) and [`Server`](crate::Server), and shut
//! it down when done. Independent managers share nothing, so tests can run
//! isolated instances side by side.
//!
//! Shutting the manager down stops every task on it; connections it drove
//! are dropped and their outstanding calls resolve with `ECONNRESET`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, EnterGuard, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::config::PollConfig;
use crate::error::{Result, RpcError};

/// Cloneable handle to a shared I/O runtime.
#[derive(Clone)]
pub struct PollManager {
    inner: Arc<PollInner>,
}

struct PollInner {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    config: PollConfig,
}

impl PollManager {
    /// Create a poll manager with default settings.
    pub fn new() -> Result<Self> {
        Self::init(PollConfig::default())
    }

    /// Create a builder for custom settings.
    pub fn builder() -> PollManagerBuilder {
        PollManagerBuilder::new()
    }

    /// Start the I/O runtime.
    ///
    /// # Errors
    ///
    /// `RpcError::Config` for zero I/O threads, `RpcError::Io` if the
    /// runtime cannot be created.
    pub fn init(config: PollConfig) -> Result<Self> {
        if config.io_threads == 0 {
            return Err(RpcError::Config(
                "poll manager needs at least one I/O thread".to_string(),
            ));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.io_threads)
            .thread_name(&config.thread_name)
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        tracing::debug!(
            "Poll manager started with {} I/O thread(s)",
            config.io_threads
        );

        Ok(Self {
            inner: Arc::new(PollInner {
                runtime: Mutex::new(Some(runtime)),
                handle,
                config,
            }),
        })
    }

    /// Settings this manager was started with.
    pub fn config(&self) -> &PollConfig {
        &self.inner.config
    }

    /// Check if [`shutdown`](Self::shutdown) has run.
    pub fn is_shutdown(&self) -> bool {
        self.inner.runtime.lock().is_none()
    }

    /// Stop the runtime, waiting up to the configured grace period for
    /// in-flight tasks. Idempotent.
    ///
    /// Called from a thread owned by this runtime, the wait is skipped.
    pub fn shutdown(&self) {
        let runtime = self.inner.runtime.lock().take();
        if let Some(runtime) = runtime {
            shutdown_runtime(runtime, self.inner.config.shutdown_timeout());
            tracing::debug!("Poll manager shut down");
        }
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Enter the runtime context so socket types can register with the
    /// I/O driver from a plain thread.
    pub(crate) fn enter(&self) -> Result<EnterGuard<'_>> {
        if self.is_shutdown() {
            return Err(RpcError::Config("poll manager is shut down".to_string()));
        }
        Ok(self.inner.handle.enter())
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }
}

impl std::fmt::Debug for PollManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollManager")
            .field("config", &self.inner.config)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Drop for PollInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

fn shutdown_runtime(runtime: Runtime, timeout: Duration) {
    // A blocking wait from inside any runtime panics (or deadlocks on our own).
    if Handle::try_current().is_ok() {
        runtime.shutdown_background();
    } else {
        runtime.shutdown_timeout(timeout);
    }
}

/// Builder for a [`PollManager`].
#[derive(Debug, Default)]
pub struct PollManagerBuilder {
    config: PollConfig,
}

impl PollManagerBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn config(mut self, config: PollConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of I/O threads.
    ///
    /// Default: 1
    pub fn io_threads(mut self, count: usize) -> Self {
        self.config.io_threads = count;
        self
    }

    /// Set the I/O thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Set the shutdown grace period.
    ///
    /// Default: 1 second
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Start the runtime.
    pub fn build(self) -> Result<PollManager> {
        PollManager::init(self.config)
    }
}
