//! Tag-aware cache facade.
//!
//! [`TaggedCache`] is the public operation surface. It connects lazily,
//! prefixes keys, encodes payloads, keeps the tag index in step with writes
//! and applies one failure policy to every operation:
//!
//! - while the connection is disabled, operations return their no-op value
//!   (`false`, `0`, `None`) and loads go straight to the fallback producer;
//! - in [`ExecutionMode::Production`] backend, codec and fallback failures are
//!   logged, handed to the error hook and turned into the no-op value;
//! - in [`ExecutionMode::Development`] the same failure is returned as `Err`.
//!
//! [`ExecutionMode::Production`]: crate::config::ExecutionMode::Production
//! [`ExecutionMode::Development`]: crate::config::ExecutionMode::Development

use crate::codec::{Codec, JsonSerializer, Serializer};
use crate::config::ConnectionConfig;
use crate::error::{CacheError, CacheResult};
use crate::invalidation::{KeySpace, TagIndex};
use crate::servers::ServerEndpoint;
use crate::traits::CacheBackend;
use futures::future::BoxFuture;
use indexmap::IndexSet;
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Callback receiving every intercepted failure.
pub type ErrorHook = Arc<dyn Fn(&CacheError) + Send + Sync>;

/// Connection lifecycle.
///
/// `Unconnected -> Connecting -> Connected | Disconnected`. A disconnected
/// cache stays disabled until [`TaggedCache::connect`] is called again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempted yet.
    Unconnected,
    /// Servers are being registered.
    Connecting,
    /// Connected and enabled.
    Connected,
    /// Connection failed or was disabled; every operation is a no-op.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

fn not_stored(keys: &[&str]) -> CacheError {
    CacheError::Backend(format!("not stored: {}", keys.join(", ")))
}

/// Absolute expiration in epoch seconds. Partial seconds round up so a
/// sub-second TTL never expires on write.
fn expires_at(ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|ttl| {
        let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        chrono::Utc::now().timestamp().max(0) as u64 + secs
    })
}

/// Cache with tag-based invalidation on top of a [`CacheBackend`].
///
/// # Examples
///
/// ```
/// use memtag_cache::*;
///
/// # async fn example() -> CacheResult<()> {
/// let config = ConnectionConfig::builder().database("shop").build()?;
/// let cache = TaggedCache::new(InMemoryBackend::new(), config);
///
/// cache.save("product:1", &"Lamp", None, &["products"]).await?;
/// cache.save("product:2", &"Desk", None, &["products"]).await?;
///
/// // Both products and the "products" tag record.
/// assert_eq!(cache.delete_by_tag("products").await?, 3);
/// assert!(!cache.has("product:1").await?);
/// # Ok(())
/// # }
/// ```
pub struct TaggedCache<B, S = JsonSerializer> {
    backend: Arc<B>,
    config: ConnectionConfig,
    codec: Codec<S>,
    keys: KeySpace,
    state: RwLock<ConnectionState>,
    connecting: Mutex<()>,
    failures: AtomicU32,
    on_error: Option<ErrorHook>,
}

impl<B: CacheBackend> TaggedCache<B, JsonSerializer> {
    /// Create a cache storing JSON payloads.
    pub fn new(backend: B, config: ConnectionConfig) -> Self {
        Self::with_serializer(backend, config, JsonSerializer)
    }
}

impl<B: CacheBackend, S: Serializer> TaggedCache<B, S> {
    /// Create a cache with a custom serializer.
    pub fn with_serializer(backend: B, config: ConnectionConfig, serializer: S) -> Self {
        Self::from_arc(Arc::new(backend), config, serializer)
    }

    /// Create a cache over a shared backend handle.
    pub fn from_arc(backend: Arc<B>, config: ConnectionConfig, serializer: S) -> Self {
        let codec = Codec::new(serializer, &config.provider);
        let keys = config.key_space();
        Self {
            backend,
            config,
            codec,
            keys,
            state: RwLock::new(ConnectionState::Unconnected),
            connecting: Mutex::new(()),
            failures: AtomicU32::new(0),
            on_error: None,
        }
    }

    /// Report intercepted failures to `hook` in addition to the log.
    pub fn with_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CacheError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Connection name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether operations currently reach the backend.
    pub fn is_enabled(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Tag index over this cache's backend and namespace.
    pub fn tag_index(&self) -> TagIndex<'_, B, S> {
        TagIndex::new(self.backend.as_ref(), &self.codec, &self.keys)
    }

    // ========== Connection ==========

    /// Connect to the configured server pool.
    ///
    /// Returns `true` immediately when already connected. Otherwise the
    /// resolved servers are registered and a fresh pool is opened; on
    /// failure the cache is disabled until the next call.
    pub async fn connect(&self) -> bool {
        let _gate = self.connecting.lock().await;
        self.connect_locked().await
    }

    async fn ensure_connected(&self) -> bool {
        match self.state() {
            ConnectionState::Connected => true,
            ConnectionState::Disconnected => false,
            ConnectionState::Unconnected | ConnectionState::Connecting => {
                let _gate = self.connecting.lock().await;
                match self.state() {
                    ConnectionState::Connected => true,
                    ConnectionState::Disconnected => false,
                    _ => self.connect_locked().await,
                }
            }
        }
    }

    async fn connect_locked(&self) -> bool {
        if self.state() == ConnectionState::Connected {
            return true;
        }

        self.set_state(ConnectionState::Connecting);
        self.failures.store(0, Ordering::SeqCst);

        let servers = self.config.servers();
        let connected = match self.open(&servers).await {
            Ok(connected) => connected,
            Err(e) => {
                memtag_log::error!(
                    target: "memtag::cache",
                    "[{}] Connection failed: {}",
                    self.config.name,
                    e
                );
                self.notify(&e);
                false
            }
        };

        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.set_state(state);
        memtag_log::info!(
            target: "memtag::cache",
            "[{}] Cache {} ({} servers configured)",
            self.config.name,
            state,
            servers.len()
        );
        connected
    }

    async fn open(&self, servers: &[ServerEndpoint]) -> CacheResult<bool> {
        if servers.is_empty() {
            memtag_log::warn!(
                target: "memtag::cache",
                "[{}] No servers configured",
                self.config.name
            );
            return Ok(false);
        }

        let timeout = self.config.timeout;
        let mut registered = 0;
        for server in servers {
            if self.config.provider.remove_failed_servers
                && !matches!(self.backend.probe(server, timeout).await, Ok(true))
            {
                memtag_log::warn!(
                    target: "memtag::cache",
                    "[{}] Skipping unreachable server {}",
                    self.config.name,
                    server
                );
                continue;
            }
            self.backend
                .add_server(server, self.config.persistent, timeout)
                .await?;
            registered += 1;
        }

        if registered == 0 {
            return Ok(false);
        }
        self.backend.connect().await
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    // ========== Failure policy ==========

    fn notify(&self, err: &CacheError) {
        if let Some(hook) = &self.on_error {
            hook(err);
        }
    }

    fn recover<T>(&self, operation: &str, err: CacheError, noop: T) -> CacheResult<T> {
        if err.is_backend_failure() {
            self.record_failure();
        }
        memtag_log::error!(
            target: "memtag::cache",
            "[{}] {} failed: {}",
            self.config.name,
            operation,
            err
        );
        self.notify(&err);

        if self.config.is_development() {
            Err(err)
        } else {
            Ok(noop)
        }
    }

    fn settle<T>(&self, operation: &str, result: CacheResult<T>, noop: T) -> CacheResult<T> {
        match result {
            Ok(value) => {
                self.failures.store(0, Ordering::SeqCst);
                Ok(value)
            }
            Err(e) => self.recover(operation, e, noop),
        }
    }

    fn record_failure(&self) {
        let limit = self.config.provider.failure_limit;
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if limit > 0 && failures >= limit {
            self.set_state(ConnectionState::Disconnected);
            memtag_log::warn!(
                target: "memtag::cache",
                "[{}] Disabled after {} consecutive backend failures",
                self.config.name,
                failures
            );
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.backend.get(&self.keys.key(key)).await? {
            Some(payload) => Ok(Some(self.codec.decode(&payload)?)),
            None => Ok(None),
        }
    }

    async fn produce<T, E, F>(&self, key: &str, fallback: F) -> CacheResult<Option<T>>
    where
        E: fmt::Display,
        F: for<'a> FnOnce(&'a Self, &'a str) -> BoxFuture<'a, Result<T, E>>,
    {
        match fallback(self, key).await {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                let err = CacheError::Fallback {
                    key: key.to_string(),
                    message: e.to_string(),
                };
                self.recover("fallback", err, None)
            }
        }
    }

    // ========== Writes ==========

    /// Store a value and tag it.
    ///
    /// `ttl` of `None` stores without expiration. Tags are associated only
    /// after the value was written.
    pub async fn save<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> CacheResult<bool>
    where
        T: Serialize + ?Sized,
    {
        if !self.ensure_connected().await {
            return Ok(false);
        }

        let result = async {
            let payload = self.codec.encode(value)?;
            if !self
                .backend
                .set(&self.keys.key(key), &payload, expires_at(ttl))
                .await?
            {
                return Err(not_stored(&[key]));
            }
            if !self.tag_index().associate(&[key], tags).await? {
                return Err(CacheError::Backend(format!(
                    "tag records for '{}' not stored",
                    key
                )));
            }
            Ok::<_, CacheError>(true)
        }
        .await;

        self.settle("save", result, false)
    }

    /// Store several values with one expiration and one tag set.
    ///
    /// Succeeds only if every write succeeded. Entries written before a
    /// failure stay written, and those are the keys that get tagged.
    pub async fn save_multiple<T>(
        &self,
        items: &[(&str, T)],
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> CacheResult<bool>
    where
        T: Serialize,
    {
        if !self.ensure_connected().await {
            return Ok(false);
        }

        let expiration = expires_at(ttl);
        let mut written: Vec<&str> = Vec::with_capacity(items.len());
        let mut refused: Vec<&str> = Vec::new();
        let result = async {
            for (key, value) in items {
                let payload = self.codec.encode(value)?;
                if self
                    .backend
                    .set(&self.keys.key(key), &payload, expiration)
                    .await?
                {
                    written.push(*key);
                } else {
                    refused.push(*key);
                }
            }
            Ok::<_, CacheError>(())
        }
        .await;

        // Keys already written are tagged even when a later write failed.
        let tagged = self.tag_index().associate(&written, tags).await;

        let result = result.and_then(|()| match tagged {
            Ok(true) if refused.is_empty() => Ok(true),
            Ok(true) => Err(not_stored(&refused)),
            Ok(false) => Err(CacheError::Backend("tag records not stored".into())),
            Err(e) => Err(e),
        });
        self.settle("save_multiple", result, false)
    }

    // ========== Reads ==========

    /// Load a value. Returns `None` on a miss or while disabled.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        if !self.ensure_connected().await {
            return Ok(None);
        }
        let result = self.lookup(key).await;
        self.settle("load", result, None)
    }

    /// Load a value, asking `fallback` on a miss or while disabled.
    ///
    /// The fallback receives the cache and the logical key. It may save the
    /// value it produces; the cache never does so on its behalf.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::FutureExt;
    /// use memtag_cache::*;
    ///
    /// # async fn example(cache: TaggedCache<InMemoryBackend>) -> CacheResult<()> {
    /// let name: Option<String> = cache
    ///     .load_or_else("user:1", |cache, key| {
    ///         async move {
    ///             let name = "Alice".to_string();
    ///             cache.save(key, &name, None, &["users"]).await?;
    ///             Ok::<_, CacheError>(name)
    ///         }
    ///         .boxed()
    ///     })
    ///     .await?;
    /// assert_eq!(name.as_deref(), Some("Alice"));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn load_or_else<T, E, F>(&self, key: &str, fallback: F) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned,
        E: fmt::Display,
        F: for<'a> FnOnce(&'a Self, &'a str) -> BoxFuture<'a, Result<T, E>>,
    {
        if self.ensure_connected().await {
            match self.lookup(key).await {
                Ok(Some(value)) => return self.settle("load", Ok(Some(value)), None),
                Ok(None) => self.failures.store(0, Ordering::SeqCst),
                Err(e) => return self.recover("load", e, None),
            }
        }
        self.produce(key, fallback).await
    }

    /// Load several values, index-aligned with `keys`.
    ///
    /// A failure on one key leaves `None` at its index and does not affect
    /// the others.
    pub async fn load_multiple<T: DeserializeOwned>(
        &self,
        keys: &[&str],
    ) -> CacheResult<Vec<Option<T>>> {
        if !self.ensure_connected().await {
            return Ok(keys.iter().map(|_| None).collect());
        }

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let result = self.lookup(key).await;
            values.push(self.settle("load_multiple", result, None)?);
        }
        Ok(values)
    }

    /// Load several values, asking `fallback` for every key that missed.
    pub async fn load_multiple_or_else<T, E, F>(
        &self,
        keys: &[&str],
        fallback: F,
    ) -> CacheResult<Vec<Option<T>>>
    where
        T: DeserializeOwned,
        E: fmt::Display,
        F: for<'a> Fn(&'a Self, &'a str) -> BoxFuture<'a, Result<T, E>>,
    {
        let enabled = self.ensure_connected().await;

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            if enabled {
                match self.lookup(key).await {
                    Ok(Some(value)) => {
                        values.push(self.settle("load_multiple", Ok(Some(value)), None)?);
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        values.push(self.recover("load_multiple", e, None)?);
                        continue;
                    }
                }
            }
            values.push(self.produce(key, &fallback).await?);
        }
        Ok(values)
    }

    /// Whether a key is stored.
    pub async fn has(&self, key: &str) -> CacheResult<bool> {
        if !self.ensure_connected().await {
            return Ok(false);
        }
        let result = self
            .backend
            .get(&self.keys.key(key))
            .await
            .map(|payload| payload.is_some());
        self.settle("has", result, false)
    }

    /// How many of `keys` are stored.
    pub async fn has_multiple(&self, keys: &[&str]) -> CacheResult<usize> {
        if !self.ensure_connected().await || keys.is_empty() {
            return Ok(0);
        }

        let full: Vec<String> = keys.iter().map(|key| self.keys.key(key)).collect();
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        let result = self
            .backend
            .get_multi(&refs)
            .await
            .map(|found| full.iter().filter(|key| found.contains_key(*key)).count());
        self.settle("has_multiple", result, 0)
    }

    // ========== Deletes ==========

    /// Delete one key.
    ///
    /// Tag records are left alone; use [`delete_multiple`](Self::delete_multiple)
    /// with hints to clean them up.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        if !self.ensure_connected().await {
            return Ok(false);
        }
        let result = self.backend.delete(&self.keys.key(key)).await;
        self.settle("delete", result, false)
    }

    /// Delete several keys, then remove them from the tags named in `hints`.
    ///
    /// Returns how many keys were actually deleted. On failure the count
    /// reached so far is returned.
    pub async fn delete_multiple(
        &self,
        keys: &[&str],
        hints: &[(&str, Vec<&str>)],
    ) -> CacheResult<usize> {
        if !self.ensure_connected().await {
            return Ok(0);
        }

        let mut deleted = 0;
        let result = async {
            for key in keys {
                if self.backend.delete(&self.keys.key(key)).await? {
                    deleted += 1;
                }
            }
            self.tag_index().disassociate(hints).await?;
            Ok::<_, CacheError>(())
        }
        .await;

        match result {
            Ok(()) => self.settle("delete_multiple", Ok(deleted), 0),
            Err(e) => self.recover("delete_multiple", e, deleted),
        }
    }

    /// Delete every key carrying any of `tags`, along with the tag records.
    ///
    /// The returned count includes deleted tag records.
    pub async fn delete_by_tags(&self, tags: &[&str]) -> CacheResult<usize> {
        if !self.ensure_connected().await || tags.is_empty() {
            return Ok(0);
        }

        let result = async {
            let members = self.tag_index().resolve_keys(tags).await?;
            let mut doomed: IndexSet<String> =
                members.iter().map(|key| self.keys.key(key)).collect();
            doomed.extend(tags.iter().map(|tag| self.keys.tag_key(tag)));

            memtag_log::debug!(
                target: "memtag::cache",
                "[{}] Invalidating {} keys for tags {:?}",
                self.config.name,
                members.len(),
                tags
            );

            let refs: Vec<&str> = doomed.iter().map(String::as_str).collect();
            self.backend.delete_multi(&refs).await
        }
        .await;

        self.settle("delete_by_tags", result, 0)
    }

    /// Delete every key carrying `tag`, along with its tag record.
    pub async fn delete_by_tag(&self, tag: &str) -> CacheResult<usize> {
        self.delete_by_tags(&[tag]).await
    }

    /// Flush every server in the pool.
    ///
    /// **Warning:** This also wipes tag records and any other namespace
    /// sharing the servers.
    pub async fn clear(&self) -> CacheResult<bool> {
        if !self.ensure_connected().await {
            return Ok(false);
        }
        let result = self.backend.flush().await;
        self.settle("clear", result, false)
    }
}

impl<B, S> fmt::Debug for TaggedCache<B, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedCache")
            .field("name", &self.config.name)
            .field("state", &*self.state.read())
            .field("prefix", &self.keys.prefix())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionMode;
    use crate::memory::InMemoryBackend;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn config() -> ConnectionConfig {
        ConnectionConfig::builder().database("test").build().unwrap()
    }

    fn cache() -> (TaggedCache<InMemoryBackend>, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        (TaggedCache::new(backend.clone(), config()), backend)
    }

    #[tokio::test]
    async fn test_lazy_connect() {
        let (cache, backend) = cache();
        assert_eq!(cache.state(), ConnectionState::Unconnected);

        assert!(!cache.has("k").await.unwrap());
        assert_eq!(cache.state(), ConnectionState::Connected);
        assert_eq!(backend.servers(), vec![ServerEndpoint::new("127.0.0.1", 11211, 1)]);
    }

    #[tokio::test]
    async fn test_connect_when_connected_keeps_pool() {
        let (cache, backend) = cache();
        assert!(cache.connect().await);
        assert!(cache.connect().await);
        assert_eq!(backend.servers().len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load_prefixed() {
        let (cache, backend) = cache();

        assert!(cache.save("user:1", &"Alice", None, &[]).await.unwrap());
        let value: Option<String> = cache.load("user:1").await.unwrap();
        assert_eq!(value.as_deref(), Some("Alice"));

        assert!(backend.get("test:user:1").await.unwrap().is_some());
        assert!(backend.get("user:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_sets_absolute_expiration() {
        let (cache, backend) = cache();
        let before = chrono::Utc::now().timestamp() as u64;

        cache
            .save("k", &1, Some(Duration::from_secs(60)), &[])
            .await
            .unwrap();
        cache.save("forever", &1, None, &[]).await.unwrap();

        let at = backend.expiration("test:k").await.unwrap();
        assert!(at >= before + 60 && at <= before + 62);
        assert_eq!(backend.expiration("test:forever").await, None);
    }

    #[tokio::test]
    async fn test_sub_second_ttl_rounds_up() {
        let (cache, backend) = cache();
        let before = chrono::Utc::now().timestamp() as u64;

        assert!(
            cache
                .save("k", &1, Some(Duration::from_millis(900)), &[])
                .await
                .unwrap()
        );
        let at = backend.expiration("test:k").await.unwrap();
        assert!(at > before && at <= before + 2);

        cache
            .save("slow", &1, Some(Duration::from_millis(1900)), &[])
            .await
            .unwrap();
        let at = backend.expiration("test:slow").await.unwrap();
        assert!(at >= before + 2 && at <= before + 3);
    }

    #[tokio::test]
    async fn test_load_or_else_runs_fallback_on_miss_only() {
        let (cache, _) = cache();
        let calls = AtomicUsize::new(0);

        cache.save("hit", &"cached", None, &[]).await.unwrap();

        let hit: Option<String> = cache
            .load_or_else("hit", |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, CacheError>("fresh".to_string()) }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(hit.as_deref(), Some("cached"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let miss: Option<String> = cache
            .load_or_else("miss", |_, key| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, CacheError>(format!("made:{}", key)) }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(miss.as_deref(), Some("made:miss"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The cache does not populate itself.
        assert!(!cache.has("miss").await.unwrap());
    }

    #[tokio::test]
    async fn test_fallback_failure_is_absent_in_production() {
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let cache = TaggedCache::new(InMemoryBackend::new(), config()).with_error_hook(move |e| {
            assert!(matches!(e, CacheError::Fallback { .. }));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let value: Option<u32> = cache
            .load_or_else("k", |_, _| async { Err::<u32, _>("boom") }.boxed())
            .await
            .unwrap();

        assert_eq!(value, None);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_returned_in_development() {
        let config = ConnectionConfig::builder()
            .mode(ExecutionMode::Development)
            .build()
            .unwrap();
        let cache = TaggedCache::new(InMemoryBackend::new(), config);

        let result: CacheResult<Option<u32>> = cache
            .load_or_else("k", |_, _| async { Err::<u32, _>("boom") }.boxed())
            .await;

        match result {
            Err(CacheError::Fallback { key, message }) => {
                assert_eq!(key, "k");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_multiple_is_index_aligned() {
        let (cache, _) = cache();
        cache.save("a", &1, None, &[]).await.unwrap();
        cache.save("c", &3, None, &[]).await.unwrap();

        let values: Vec<Option<i32>> = cache.load_multiple(&["a", "b", "c"]).await.unwrap();
        assert_eq!(values, vec![Some(1), None, Some(3)]);

        let values: Vec<Option<i32>> = cache
            .load_multiple_or_else(&["a", "b", "c"], |_, key| {
                let result = if key == "b" { Ok(2) } else { Err("unexpected") };
                async move { result }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(values, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn test_load_multiple_fallback_failure_stays_per_key() {
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let disabled = TaggedCache::new(InMemoryBackend::unreachable(), config())
            .with_error_hook(move |e| {
                assert!(matches!(e, CacheError::Fallback { key, .. } if key == "b"));
                seen.fetch_add(1, Ordering::SeqCst);
            });

        let values: Vec<Option<i32>> = disabled
            .load_multiple_or_else(&["a", "b", "c"], |_, key| {
                let result = if key == "b" { Err("boom") } else { Ok(7) };
                async move { result }.boxed()
            })
            .await
            .unwrap();

        assert_eq!(values, vec![Some(7), None, Some(7)]);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        let (cache, _) = cache();
        cache.save("a", &1, None, &[]).await.unwrap();
        let values: Vec<Option<i32>> = cache
            .load_multiple_or_else(&["a", "b", "c"], |_, key| {
                let result = if key == "b" { Err("boom") } else { Ok(3) };
                async move { result }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(values, vec![Some(1), None, Some(3)]);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_a_miss_in_production() {
        let (cache, backend) = cache();
        backend.set("test:k", b"\x00not json", None).await.unwrap();
        cache.connect().await;

        let value: Option<u32> = cache.load("k").await.unwrap();
        assert_eq!(value, None);
        // Codec errors are not backend failures.
        assert!(cache.is_enabled());
    }

    #[tokio::test]
    async fn test_single_delete_leaves_tag_records() {
        let (cache, backend) = cache();
        cache.save("k", &1, None, &["t"]).await.unwrap();

        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert!(backend.get("test:cache_tag:t").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_multiple_with_hints() {
        let (cache, backend) = cache();
        cache.save("a", &1, None, &["t"]).await.unwrap();
        cache.save("b", &2, None, &["t"]).await.unwrap();

        let deleted = cache
            .delete_multiple(&["a", "b", "missing"], &[("a", vec!["t"]), ("b", vec!["t"])])
            .await
            .unwrap();

        assert_eq!(deleted, 2);
        assert!(backend.get("test:cache_tag:t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_by_tags_counts_tag_records() {
        let (cache, _) = cache();
        cache.save("a", &1, None, &["x"]).await.unwrap();
        cache.save("b", &2, None, &["x", "y"]).await.unwrap();
        cache.save("c", &3, None, &["z"]).await.unwrap();

        assert_eq!(cache.delete_by_tags(&["x", "y", "none"]).await.unwrap(), 4);
        assert_eq!(cache.has_multiple(&["a", "b", "c"]).await.unwrap(), 1);
        assert_eq!(cache.delete_by_tags(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_has_multiple_counts_duplicates() {
        let (cache, _) = cache();
        cache.save("a", &1, None, &[]).await.unwrap();
        assert_eq!(cache.has_multiple(&["a", "a", "b"]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let (cache, backend) = cache();
        cache.save("a", &1, None, &["t"]).await.unwrap();
        assert!(cache.clear().await.unwrap());
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_server_pool_disconnects() {
        let config = ConnectionConfig::builder().host("").build().unwrap();
        let backend = InMemoryBackend::new();
        let cache = TaggedCache::new(backend, config);

        assert!(!cache.connect().await);
        assert_eq!(cache.state(), ConnectionState::Disconnected);
        assert!(!cache.save("k", &1, None, &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnected_does_not_retry_implicitly() {
        let backend = InMemoryBackend::unreachable();
        let cache = TaggedCache::new(backend.clone(), config());

        assert!(!cache.has("k").await.unwrap());
        assert_eq!(cache.state(), ConnectionState::Disconnected);

        backend.set_reachable(true);
        assert!(!cache.save("k", &1, None, &[]).await.unwrap());
        assert_eq!(cache.state(), ConnectionState::Disconnected);

        assert!(cache.connect().await);
        assert!(cache.save("k", &1, None, &[]).await.unwrap());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }
}
