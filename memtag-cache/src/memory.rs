//! Process-local backend.
//!
//! Behaves like a single memcached pool living in this process: absolute
//! expiration, flat namespace, no tags. Clones share the same storage, so a
//! test can keep a handle for raw inspection after handing one to a cache.

use crate::error::{CacheError, CacheResult};
use crate::servers::ServerEndpoint;
use crate::traits::CacheBackend;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<u64>,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[derive(Default)]
struct Pool {
    pending: Vec<ServerEndpoint>,
    active: Vec<ServerEndpoint>,
    down: HashSet<String>,
}

/// In-memory backend.
#[derive(Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<HashMap<String, Entry>>>,
    pool: Arc<Mutex<Pool>>,
    reachable: Arc<AtomicBool>,
}

impl InMemoryBackend {
    /// Create an empty, reachable backend.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            pool: Arc::new(Mutex::new(Pool::default())),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A backend whose handshake never succeeds.
    pub fn unreachable() -> Self {
        let backend = Self::new();
        backend.set_reachable(false);
        backend
    }

    /// Simulate the whole pool going away or coming back.
    ///
    /// While unreachable, the handshake reports no server and every data
    /// operation fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make one server fail its probe.
    pub fn mark_down(&self, host: &str, port: u16) {
        self.pool
            .lock()
            .down
            .insert(ServerEndpoint::new(host, port, 1).address());
    }

    /// Servers taken into the pool by the last successful `connect`.
    pub fn servers(&self) -> Vec<ServerEndpoint> {
        self.pool.lock().active.clone()
    }

    /// Number of live entries, tag records included.
    pub async fn len(&self) -> usize {
        let now = unix_now();
        self.data
            .read()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether no live entry is stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Absolute expiration stored for a key.
    pub async fn expiration(&self, key: &str) -> Option<u64> {
        self.data.read().await.get(key).and_then(|e| e.expires_at)
    }

    fn ensure_reachable(&self) -> CacheResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Backend("in-memory pool is unreachable".into()))
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn add_server(
        &self,
        server: &ServerEndpoint,
        _persistent: bool,
        _timeout: Duration,
    ) -> CacheResult<()> {
        self.pool.lock().pending.push(server.clone());
        Ok(())
    }

    async fn probe(&self, server: &ServerEndpoint, _timeout: Duration) -> CacheResult<bool> {
        let down = self.pool.lock().down.contains(&server.address());
        Ok(self.reachable.load(Ordering::SeqCst) && !down)
    }

    async fn connect(&self) -> CacheResult<bool> {
        let mut pool = self.pool.lock();
        pool.active = std::mem::take(&mut pool.pending);
        Ok(self.reachable.load(Ordering::SeqCst) && !pool.active.is_empty())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.ensure_reachable()?;
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|entry| entry.is_live(unix_now()))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], expires_at: Option<u64>) -> CacheResult<bool> {
        self.ensure_reachable()?;
        let entry = Entry {
            value: value.to_vec(),
            expires_at,
        };
        self.data.write().await.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.ensure_reachable()?;
        let removed = self.data.write().await.remove(key);
        Ok(removed.is_some_and(|entry| entry.is_live(unix_now())))
    }

    async fn flush(&self) -> CacheResult<bool> {
        self.ensure_reachable()?;
        self.data.write().await.clear();
        Ok(true)
    }
}
