//! Memcached backend.

use crate::error::{CacheError, CacheResult};
use crate::servers::ServerEndpoint;
use crate::traits::CacheBackend;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::Duration;

/// Connections kept per server when the pool is persistent.
const PERSISTENT_POOL_SIZE: u32 = 4;

#[derive(Debug, Default)]
struct Registrations {
    urls: Vec<String>,
    persistent: bool,
    timeout: Option<Duration>,
}

/// Memcached backend.
///
/// Note: The `memcache` crate doesn't have native async support,
/// so every call runs on the blocking pool via `spawn_blocking`.
///
/// The client has no notion of server weights; a server of weight `n` is
/// registered `n` times so the key distribution follows the weights.
#[derive(Default)]
pub struct MemcachedBackend {
    client: RwLock<Option<memcache::Client>>,
    pending: Mutex<Registrations>,
}

impl MemcachedBackend {
    /// Create a backend with no servers. Servers are added by the cache at
    /// connect time.
    pub fn new() -> Self {
        Self::default()
    }

    fn weighted_urls(server: &ServerEndpoint) -> impl Iterator<Item = String> {
        let url = server.url();
        std::iter::repeat_n(url, server.weight.max(1) as usize)
    }

    fn client(&self) -> CacheResult<memcache::Client> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| CacheError::Unavailable("memcached pool is not connected".into()))
    }
}

async fn blocking<T, F>(f: F) -> CacheResult<T>
where
    F: FnOnce() -> Result<T, memcache::MemcacheError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

fn expiration(expires_at: Option<u64>) -> u32 {
    expires_at
        .map(|at| u32::try_from(at).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn open(
    urls: Vec<String>,
    pool_size: u32,
    timeout: Option<Duration>,
) -> Result<memcache::Client, memcache::MemcacheError> {
    let client = memcache::Client::with_pool_size(urls, pool_size)?;
    client.set_read_timeout(timeout)?;
    client.set_write_timeout(timeout)?;
    Ok(client)
}

#[async_trait]
impl CacheBackend for MemcachedBackend {
    async fn add_server(
        &self,
        server: &ServerEndpoint,
        persistent: bool,
        timeout: Duration,
    ) -> CacheResult<()> {
        let mut pending = self.pending.lock();
        pending.urls.extend(Self::weighted_urls(server));
        pending.persistent |= persistent;
        pending.timeout = Some(timeout);
        Ok(())
    }

    async fn probe(&self, server: &ServerEndpoint, timeout: Duration) -> CacheResult<bool> {
        let url = server.url();
        let answered = blocking(move || {
            let client = open(vec![url], 1, Some(timeout))?;
            client.version()
        })
        .await;

        match answered {
            Ok(versions) => Ok(!versions.is_empty()),
            Err(e) => {
                memtag_log::debug!(target: "memtag::memcached", "Probe of {} failed: {}", server, e);
                Ok(false)
            }
        }
    }

    async fn connect(&self) -> CacheResult<bool> {
        let registrations = std::mem::take(&mut *self.pending.lock());
        if registrations.urls.is_empty() {
            return Ok(false);
        }

        let pool_size = if registrations.persistent {
            PERSISTENT_POOL_SIZE
        } else {
            1
        };
        let urls = registrations.urls;
        let timeout = registrations.timeout;

        let (client, versions) = blocking(move || {
            let client = open(urls, pool_size, timeout)?;
            let versions = client.version()?;
            Ok((client, versions))
        })
        .await?;

        if versions.is_empty() {
            return Ok(false);
        }

        *self.client.write() = Some(client);
        Ok(true)
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let client = self.client()?;
        let key = key.to_string();
        blocking(move || client.get::<Vec<u8>>(&key)).await
    }

    async fn get_multi(&self, keys: &[&str]) -> CacheResult<HashMap<String, Vec<u8>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let client = self.client()?;
        let keys: Vec<String> = keys.iter().map(|k| (*k).to_string()).collect();
        blocking(move || {
            let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            client.gets::<Vec<u8>>(&refs)
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], expires_at: Option<u64>) -> CacheResult<bool> {
        let client = self.client()?;
        let key = key.to_string();
        let value = value.to_vec();
        let expiration = expiration(expires_at);
        blocking(move || client.set(&key, value.as_slice(), expiration)).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let client = self.client()?;
        let key = key.to_string();
        blocking(move || client.delete(&key)).await
    }

    async fn flush(&self) -> CacheResult<bool> {
        let client = self.client()?;
        blocking(move || client.flush()).await?;
        Ok(true)
    }
}
