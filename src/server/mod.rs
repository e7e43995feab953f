//! Server builder, registration and listener lifecycle.
//!
//! A [`Server`] maps call IDs to handlers and serves them over TCP. The
//! accept loop and every connection run on a [`PollManager`]; handlers run
//! on its blocking pool, at most `max_concurrent_handlers` at a time.
//!
//! # Example
//!
//! ```no_run
//! use wirecall::marshal::{TypeDesc, Value};
//! use wirecall::{PollManager, Server};
//!
//! fn main() -> wirecall::Result<()> {
//!     let poll = PollManager::new()?;
//!     let server = Server::builder().build(&poll)?;
//!
//!     server.reg_func(1987, &[TypeDesc::I32, TypeDesc::I32], &[TypeDesc::I32], |args: Vec<Value>| {
//!         let a = args[0].as_i32().unwrap_or_default();
//!         let b = args[1].as_i32().unwrap_or_default();
//!         Ok(vec![Value::I32(a.wrapping_add(b))])
//!     })?;
//!
//!     let addr = server.start("127.0.0.1:8848")?;
//!     println!("listening on {}", addr);
//!     Ok(())
//! }
//! ```

mod connection;
mod registry;

pub use registry::{Handler, HandlerResult};

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};

use crate::config::ServerConfig;
use crate::error::{Result, RpcError};
use crate::marshal::{TypeDesc, TypeRegistry, Value};
use crate::poll::PollManager;
use crate::service::ServiceDescriptor;
use registry::{FuncRegistry, Registration};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Builder for configuring and creating a server.
#[derive(Default)]
pub struct ServerBuilder {
    registry: Arc<TypeRegistry>,
    config: ServerConfig,
    services: Vec<ServiceDescriptor>,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Struct layouts used to decode arguments and encode results.
    pub fn registry(mut self, registry: impl Into<Arc<TypeRegistry>>) -> Self {
        self.registry = registry.into();
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum number of handlers running at once.
    ///
    /// Requests past the limit wait for a slot.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the largest accepted request payload.
    ///
    /// Default: 64 MB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set the maximum queued reply frames per connection.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.max_pending_frames = limit;
        self
    }

    /// Register a service when the server is built.
    pub fn service(mut self, service: ServiceDescriptor) -> Self {
        self.services.push(service);
        self
    }

    /// Build the server on a poll manager.
    ///
    /// # Errors
    ///
    /// `RpcError::Config` for a zero handler limit, a payload limit above
    /// what the size prefix can carry, or if a queued service fails to
    /// register.
    pub fn build(self, poll: &PollManager) -> Result<Server> {
        self.config.validate()?;

        let server = Server {
            poll: poll.clone(),
            shared: Arc::new(ServerShared {
                registry: self.registry,
                funcs: RwLock::new(FuncRegistry::new()),
                semaphore: Arc::new(Semaphore::new(self.config.max_concurrent_handlers)),
                connections: AtomicUsize::new(0),
                config: self.config,
            }),
            listener: Mutex::new(None),
        };
        for service in &self.services {
            server.reg_svc(service)?;
        }
        Ok(server)
    }
}

/// State shared by the accept loop, every connection, and the server handle.
pub(crate) struct ServerShared {
    registry: Arc<TypeRegistry>,
    funcs: RwLock<FuncRegistry>,
    semaphore: Arc<Semaphore>,
    connections: AtomicUsize,
    config: ServerConfig,
}

struct Listening {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

/// An RPC server.
///
/// Registration works before and after [`start`](Self::start); requests
/// already dispatched keep the handler they were dispatched to.
pub struct Server {
    poll: PollManager,
    shared: Arc<ServerShared>,
    listener: Mutex<Option<Listening>>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Register a handler for a call ID.
    ///
    /// # Errors
    ///
    /// `RpcError::Config` if the ID is taken or a type is not registered.
    pub fn reg_func<F>(
        &self,
        call_id: i32,
        arg_types: &[TypeDesc],
        result_types: &[TypeDesc],
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared.registry.check_all(arg_types)?;
        self.shared.registry.check_all(result_types)?;

        let registration = Registration::new(call_id, arg_types, result_types, Arc::new(handler));
        self.shared.funcs.write().register(registration)
    }

    /// Register every method of a service, or none of them.
    ///
    /// # Errors
    ///
    /// `RpcError::Config` if any call ID is taken (by an earlier
    /// registration or another method of the same service) or any type is
    /// not registered.
    pub fn reg_svc(&self, service: &ServiceDescriptor) -> Result<()> {
        let mut batch = Vec::with_capacity(service.methods().len());
        for method in service.methods() {
            let sig = method.signature();
            self.shared.registry.check_all(&sig.arg_types)?;
            self.shared.registry.check_all(&sig.result_types)?;
            batch.push(
                Registration::new(sig.call_id, &sig.arg_types, &sig.result_types, method.handler())
                    .named(format!("{}.{}", service.name(), method.name())),
            );
        }

        self.shared.funcs.write().register_all(batch)?;
        tracing::info!(
            "Registered service {} ({} method(s))",
            service.name(),
            service.methods().len()
        );
        Ok(())
    }

    /// Remove a registration; returns whether one existed.
    pub fn unreg(&self, call_id: i32) -> bool {
        self.shared.funcs.write().remove(call_id)
    }

    /// Check if a call ID has a handler.
    pub fn is_registered(&self, call_id: i32) -> bool {
        self.shared.funcs.read().contains(call_id)
    }

    /// Number of registered call IDs.
    pub fn registered_count(&self) -> usize {
        self.shared.funcs.read().len()
    }

    /// Bind `addr` (`"host:port"`, port 0 picks a free one) and start
    /// accepting. Returns the bound address.
    ///
    /// # Errors
    ///
    /// `RpcError::Config` if already listening or the poll manager is shut
    /// down, `RpcError::Io` if binding fails.
    pub fn start(&self, addr: &str) -> Result<SocketAddr> {
        let mut listening = self.listener.lock();
        if let Some(l) = listening.as_ref() {
            return Err(RpcError::Config(format!(
                "server is already listening on {}",
                l.addr
            )));
        }

        let std_listener = StdTcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let listener = {
            let _enter = self.poll.enter()?;
            TcpListener::from_std(std_listener)?
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.poll
            .spawn(accept_loop(listener, self.shared.clone(), shutdown_rx));

        tracing::info!("Server listening on {}", local_addr);
        *listening = Some(Listening {
            addr: local_addr,
            shutdown: shutdown_tx,
        });
        Ok(local_addr)
    }

    /// Stop accepting and close every live connection. Idempotent; the
    /// server can be started again afterwards.
    pub fn stop(&self) {
        if let Some(l) = self.listener.lock().take() {
            let _ = l.shutdown.send(true);
            tracing::info!("Server on {} stopped", l.addr);
        }
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|l| l.addr)
    }

    /// Check if the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Accepted connection from {}", peer);
                    tokio::spawn(connection::serve(
                        stream,
                        peer,
                        shared.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
    tracing::debug!("Accept loop exited");
}
