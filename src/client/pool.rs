//! Per-address client cache.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Client, ClientBuilder};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::marshal::TypeRegistry;
use crate::poll::PollManager;

/// Shares one connected [`Client`] per `"host:port"` address.
///
/// A cached client whose connection has dropped is replaced on the next
/// [`get_client`](Self::get_client).
pub struct ClientPool {
    poll: PollManager,
    registry: Arc<TypeRegistry>,
    config: ClientConfig,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl ClientPool {
    /// Create an empty pool whose clients share `registry` and `config`.
    pub fn new(poll: &PollManager, registry: impl Into<Arc<TypeRegistry>>, config: ClientConfig) -> Self {
        Self {
            poll: poll.clone(),
            registry: registry.into(),
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Return the client for `addr`, connecting on first use.
    ///
    /// The pool lock is held while connecting, so concurrent callers for a
    /// new address share one connection attempt. A replaced client is closed
    /// only after the lock is released.
    pub fn get_client(&self, addr: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock();
        let stale = match clients.get(addr) {
            Some(client) if client.is_connected() => return Ok(client.clone()),
            Some(_) => {
                tracing::debug!("Replacing disconnected client for {}", addr);
                clients.remove(addr)
            }
            None => None,
        };

        let connected = ClientBuilder::new()
            .registry(self.registry.clone())
            .config(self.config.clone())
            .connect(&self.poll, addr)
            .map(Arc::new);
        if let Ok(client) = &connected {
            clients.insert(addr.to_string(), client.clone());
        }
        drop(clients);

        if let Some(stale) = stale {
            stale.close();
        }
        connected
    }

    /// Close and forget every cached client.
    pub fn close_all(&self) {
        let clients: Vec<Arc<Client>> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close();
        }
    }

    /// Number of cached clients.
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    /// Check if the pool holds no clients.
    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

impl Drop for ClientPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_get_client_is_cached() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let poll = PollManager::new().unwrap();
        let pool = ClientPool::new(&poll, TypeRegistry::new(), ClientConfig::default());

        let a = pool.get_client(&addr).unwrap();
        let b = pool.get_client(&addr).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);

        pool.close_all();
        assert!(pool.is_empty());
        assert!(!a.is_connected());
    }

    #[test]
    fn test_closed_client_is_replaced() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let poll = PollManager::new().unwrap();
        let pool = ClientPool::new(&poll, TypeRegistry::new(), ClientConfig::default());

        let first = pool.get_client(&addr).unwrap();
        first.close();

        let second = pool.get_client(&addr).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_connected());
    }

    #[test]
    fn test_stale_client_closed_outside_pool_lock() {
        use std::sync::mpsc;
        use std::time::{Duration, Instant};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let poll = PollManager::new().unwrap();
        let pool = Arc::new(ClientPool::new(&poll, TypeRegistry::new(), ClientConfig::default()));

        let stale = pool.get_client(&addr).unwrap();
        let (conn, _) = listener.accept().unwrap();

        // The disconnect callback is still running, and needs the pool lock,
        // when the replacement closes the stale client.
        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();
        let reentrant = pool.clone();
        stale
            .async_call_with_callback(1, &[], &[], &[], move |r| {
                let _ = started_tx.send(());
                let _ = go_rx.recv();
                let _ = done_tx.send((r.error_code, reentrant.len()));
            })
            .unwrap();

        drop(conn);
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while stale.is_connected() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!stale.is_connected());

        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = go_tx.send(());
        });
        let fresh = pool.get_client(&addr).unwrap();
        release.join().unwrap();

        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert!(fresh.is_connected());
        let (code, cached) = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(code, 0);
        assert_eq!(cached, 1);
    }

    #[test]
    fn test_connect_failure_is_not_cached() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let poll = PollManager::new().unwrap();
        let pool = ClientPool::new(&poll, TypeRegistry::new(), ClientConfig::default());

        assert!(pool.get_client(&format!("127.0.0.1:{}", port)).is_err());
        assert!(pool.is_empty());
    }
}
