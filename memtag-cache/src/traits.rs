//! Backend connection trait definition.

use crate::error::CacheResult;
use crate::servers::ServerEndpoint;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// A handle to one or more key-value servers.
///
/// Keys arrive fully prefixed and values are opaque framed payloads; the
/// backend knows nothing about tags. Every call may block on I/O bounded
/// by the connection timeout.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Register one server of the pool. Called for every resolved endpoint,
    /// in order, before [`connect`](Self::connect).
    async fn add_server(
        &self,
        server: &ServerEndpoint,
        persistent: bool,
        timeout: Duration,
    ) -> CacheResult<()>;

    /// Check whether a single server answers.
    ///
    /// Used to leave dead servers out of the pool when the connection is
    /// configured to remove failed servers.
    async fn probe(&self, server: &ServerEndpoint, timeout: Duration) -> CacheResult<bool> {
        let _ = (server, timeout);
        Ok(true)
    }

    /// Open the registered pool, consuming the registrations.
    ///
    /// Returns `Ok(false)` when no server answered the handshake.
    async fn connect(&self) -> CacheResult<bool>;

    /// Get a raw payload.
    ///
    /// Returns `Ok(None)` on a miss.
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store a raw payload.
    ///
    /// # Arguments
    ///
    /// * `key` - The full backend key
    /// * `value` - The payload
    /// * `expires_at` - Absolute expiration as Unix seconds, `None` for no expiration
    async fn set(&self, key: &str, value: &[u8], expires_at: Option<u64>) -> CacheResult<bool>;

    /// Delete a key. Returns whether something was deleted.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Remove every key on every server.
    ///
    /// **Warning:** This wipes all namespaces sharing the servers.
    async fn flush(&self) -> CacheResult<bool>;

    // ========== Batch Operations ==========

    /// Get several payloads. Missing keys are absent from the map.
    async fn get_multi(&self, keys: &[&str]) -> CacheResult<HashMap<String, Vec<u8>>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert((*key).to_string(), value);
            }
        }
        Ok(found)
    }

    /// Store several payloads with one expiration. `true` only if every write succeeded.
    async fn set_multi(
        &self,
        items: &[(String, Vec<u8>)],
        expires_at: Option<u64>,
    ) -> CacheResult<bool> {
        let mut all = true;
        for (key, value) in items {
            all &= self.set(key, value, expires_at).await?;
        }
        Ok(all)
    }

    /// Delete several keys. Returns how many were actually deleted.
    async fn delete_multi(&self, keys: &[&str]) -> CacheResult<usize> {
        let mut deleted = 0;
        for key in keys {
            if self.delete(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
