//! Tag-based cache invalidation.
//!
//! The backend has no grouping of its own, so every tag is materialized as a
//! *tag record*: an ordinary entry under `<prefix>cache_tag:<tag>` whose value
//! is the list of logical keys currently carrying that tag.
//!
//! Records are maintained with plain read-modify-write. There is no lock and
//! no compare-and-swap: when two writers fetch the same record and commit in
//! turn, the second commit replaces the first one's additions. The split
//! [`TagIndex::fetch`] / [`TagIndex::commit`] phases make that visible.

use crate::codec::{Codec, Serializer};
use crate::error::CacheResult;
use crate::traits::CacheBackend;
use indexmap::{IndexMap, IndexSet};

/// Marker placed between the namespace prefix and the tag name.
pub const TAG_NAMESPACE: &str = "cache_tag:";

/// Namespace prefix policy.
///
/// Every key that reaches a backend goes through here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space with a literal prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The prefix shared by entries and tag records.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Backend key of a regular entry.
    pub fn key(&self, logical: &str) -> String {
        format!("{}{}", self.prefix, logical)
    }

    /// Backend key of the record for `tag`.
    pub fn tag_key(&self, tag: &str) -> String {
        format!("{}{}{}", self.prefix, TAG_NAMESPACE, tag)
    }
}

/// Membership of one tag, as read from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    keys: IndexSet<String>,
    existed: bool,
    dirty: bool,
}

impl TagRecord {
    fn missing() -> Self {
        Self {
            keys: IndexSet::new(),
            existed: false,
            dirty: false,
        }
    }

    fn stored(keys: IndexSet<String>) -> Self {
        Self {
            keys,
            existed: true,
            dirty: false,
        }
    }

    /// Logical keys in insertion order.
    pub fn keys(&self) -> &IndexSet<String> {
        &self.keys
    }

    /// Whether the record was present in the backend when fetched.
    pub fn existed(&self) -> bool {
        self.existed
    }

    /// Whether the membership changed since it was fetched.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// A batch of fetched tag records pending commit.
#[derive(Debug, Clone, Default)]
pub struct TagRecords {
    records: IndexMap<String, TagRecord>,
}

impl TagRecords {
    /// Add `key` to `tag`. Returns `true` if the membership changed.
    pub fn insert(&mut self, tag: &str, key: &str) -> bool {
        let record = self
            .records
            .entry(tag.to_string())
            .or_insert_with(TagRecord::missing);
        let added = record.keys.insert(key.to_string());
        record.dirty |= added;
        added
    }

    /// Remove `key` from `tag`. Returns `true` if it was a member.
    pub fn remove(&mut self, tag: &str, key: &str) -> bool {
        let Some(record) = self.records.get_mut(tag) else {
            return false;
        };
        let removed = record.keys.shift_remove(key);
        record.dirty |= removed;
        removed
    }

    /// Record for one tag, if it was fetched.
    pub fn get(&self, tag: &str) -> Option<&TagRecord> {
        self.records.get(tag)
    }

    /// Union of every fetched membership.
    pub fn members(&self) -> IndexSet<String> {
        self.records
            .values()
            .flat_map(|record| record.keys.iter().cloned())
            .collect()
    }

    /// Tags in this batch.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Number of tags in this batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no tag.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Reverse index from tags to keys, stored in the backend itself.
///
/// Holds no state: every call reads and writes tag records through the
/// borrowed backend. Round-trips are bounded by the number of distinct tags,
/// never by keys times tags.
pub struct TagIndex<'a, B: ?Sized, S> {
    backend: &'a B,
    codec: &'a Codec<S>,
    keys: &'a KeySpace,
}

impl<'a, B, S> TagIndex<'a, B, S>
where
    B: CacheBackend + ?Sized,
    S: Serializer,
{
    /// Borrow a backend, codec and key space.
    pub fn new(backend: &'a B, codec: &'a Codec<S>, keys: &'a KeySpace) -> Self {
        Self {
            backend,
            codec,
            keys,
        }
    }

    /// Read the records of `tags` in one batch. Missing records come back
    /// empty.
    pub async fn fetch(&self, tags: &[&str]) -> CacheResult<TagRecords> {
        let tags: IndexSet<&str> = tags.iter().copied().collect();
        if tags.is_empty() {
            return Ok(TagRecords::default());
        }

        let tag_keys: Vec<String> = tags.iter().map(|tag| self.keys.tag_key(tag)).collect();
        let refs: Vec<&str> = tag_keys.iter().map(String::as_str).collect();
        let mut stored = self.backend.get_multi(&refs).await?;

        let mut records = IndexMap::with_capacity(tags.len());
        for (tag, tag_key) in tags.into_iter().zip(&tag_keys) {
            let record = match stored.remove(tag_key) {
                Some(payload) => TagRecord::stored(self.codec.decode(&payload)?),
                None => TagRecord::missing(),
            };
            records.insert(tag.to_string(), record);
        }

        Ok(TagRecords { records })
    }

    /// Write back the dirty records of a batch.
    ///
    /// Records that became empty are deleted rather than stored empty.
    /// Returns `true` if every write went through.
    pub async fn commit(&self, records: TagRecords) -> CacheResult<bool> {
        let mut writes = Vec::new();
        let mut removals = Vec::new();

        for (tag, record) in records.records {
            if !record.dirty {
                continue;
            }
            let tag_key = self.keys.tag_key(&tag);
            if record.keys.is_empty() {
                if record.existed {
                    removals.push(tag_key);
                }
            } else {
                writes.push((tag_key, self.codec.encode(&record.keys)?));
            }
        }

        memtag_log::trace!(
            target: "memtag::tags",
            "Committing {} tag records, pruning {}",
            writes.len(),
            removals.len()
        );

        let mut ok = true;
        if !writes.is_empty() {
            ok &= self.backend.set_multi(&writes, None).await?;
        }
        if !removals.is_empty() {
            let refs: Vec<&str> = removals.iter().map(String::as_str).collect();
            self.backend.delete_multi(&refs).await?;
        }
        Ok(ok)
    }

    /// Make every key a member of every tag.
    ///
    /// Records that already list a key are left untouched, so associating
    /// twice is the same as associating once.
    pub async fn associate(&self, keys: &[&str], tags: &[&str]) -> CacheResult<bool> {
        if keys.is_empty() || tags.is_empty() {
            return Ok(true);
        }

        let mut records = self.fetch(tags).await?;
        for tag in tags {
            for key in keys {
                records.insert(tag, key);
            }
        }
        self.commit(records).await
    }

    /// Union of the members of `tags`. Tags without a record add nothing.
    pub async fn resolve_keys(&self, tags: &[&str]) -> CacheResult<IndexSet<String>> {
        Ok(self.fetch(tags).await?.members())
    }

    /// Remove keys from the tags they are known to carry.
    pub async fn disassociate(&self, key_tags: &[(&str, Vec<&str>)]) -> CacheResult<bool> {
        let tags: Vec<&str> = key_tags
            .iter()
            .flat_map(|(_, tags)| tags.iter().copied())
            .collect();
        if tags.is_empty() {
            return Ok(true);
        }

        let mut records = self.fetch(&tags).await?;
        for (key, tags) in key_tags {
            for tag in tags {
                records.remove(tag, key);
            }
        }
        self.commit(records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonSerializer;
    use crate::error::CacheResult;
    use crate::memory::InMemoryBackend;
    use crate::servers::ServerEndpoint;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // Counts backend round-trips on top of the in-memory store.
    #[derive(Default)]
    struct CountingBackend {
        inner: InMemoryBackend,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for CountingBackend {
        async fn add_server(
            &self,
            server: &ServerEndpoint,
            persistent: bool,
            timeout: Duration,
        ) -> CacheResult<()> {
            self.inner.add_server(server, persistent, timeout).await
        }

        async fn connect(&self) -> CacheResult<bool> {
            self.inner.connect().await
        }

        async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn get_multi(&self, keys: &[&str]) -> CacheResult<HashMap<String, Vec<u8>>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_multi(keys).await
        }

        async fn set(&self, key: &str, value: &[u8], expires_at: Option<u64>) -> CacheResult<bool> {
            self.inner.set(key, value, expires_at).await
        }

        async fn set_multi(
            &self,
            items: &[(String, Vec<u8>)],
            expires_at: Option<u64>,
        ) -> CacheResult<bool> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set_multi(items, expires_at).await
        }

        async fn delete(&self, key: &str) -> CacheResult<bool> {
            self.inner.delete(key).await
        }

        async fn flush(&self) -> CacheResult<bool> {
            self.inner.flush().await
        }
    }

    struct Fixture {
        backend: CountingBackend,
        codec: Codec<JsonSerializer>,
        keys: KeySpace,
    }

    impl Fixture {
        fn new(prefix: &str) -> Self {
            Self {
                backend: CountingBackend::default(),
                codec: Codec::plain(JsonSerializer),
                keys: KeySpace::new(prefix),
            }
        }

        fn index(&self) -> TagIndex<'_, CountingBackend, JsonSerializer> {
            TagIndex::new(&self.backend, &self.codec, &self.keys)
        }

        async fn raw_members(&self, tag: &str) -> Option<Vec<String>> {
            let payload = self.backend.inner.get(&self.keys.tag_key(tag)).await.unwrap()?;
            Some(self.codec.decode(&payload).unwrap())
        }
    }

    #[test]
    fn test_key_space() {
        let keys = KeySpace::new("app:");
        assert_eq!(keys.key("user:1"), "app:user:1");
        assert_eq!(keys.tag_key("users"), "app:cache_tag:users");
        assert_eq!(KeySpace::default().tag_key("t"), "cache_tag:t");
    }

    #[tokio::test]
    async fn test_associate_is_idempotent() {
        let fx = Fixture::new("");
        let index = fx.index();

        index.associate(&["k"], &["t"]).await.unwrap();
        index.associate(&["k"], &["t"]).await.unwrap();

        assert_eq!(fx.raw_members("t").await, Some(vec!["k".to_string()]));
    }

    #[tokio::test]
    async fn test_associate_preserves_insertion_order() {
        let fx = Fixture::new("ns:");
        let index = fx.index();

        index.associate(&["b", "a"], &["t"]).await.unwrap();
        index.associate(&["c", "a"], &["t"]).await.unwrap();

        assert_eq!(
            fx.raw_members("t").await,
            Some(vec!["b".to_string(), "a".to_string(), "c".to_string()])
        );
    }

    #[tokio::test]
    async fn test_round_trips_bounded_by_distinct_tags() {
        let fx = Fixture::new("");
        let index = fx.index();

        index
            .associate(&["k1", "k2", "k3"], &["a", "b", "a"])
            .await
            .unwrap();

        assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 1);
        assert_eq!(fx.backend.writes.load(Ordering::SeqCst), 1);

        // Nothing changes, nothing is written.
        index.associate(&["k2"], &["a", "b"]).await.unwrap();
        assert_eq!(fx.backend.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_inputs_are_noops() {
        let fx = Fixture::new("");
        let index = fx.index();

        assert!(index.associate(&["k"], &[]).await.unwrap());
        assert!(index.associate(&[], &["t"]).await.unwrap());
        assert!(index.disassociate(&[]).await.unwrap());
        assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 0);
        assert!(index.resolve_keys(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_union() {
        let fx = Fixture::new("");
        let index = fx.index();

        index.associate(&["k1"], &["a", "b"]).await.unwrap();
        index.associate(&["k2"], &["b"]).await.unwrap();

        let b = index.resolve_keys(&["b"]).await.unwrap();
        assert_eq!(b.len(), 2);
        assert!(b.contains("k1") && b.contains("k2"));

        let both = index.resolve_keys(&["a", "b", "unknown"]).await.unwrap();
        assert_eq!(both.len(), 2);
    }

    #[tokio::test]
    async fn test_disassociate_prunes_empty_records() {
        let fx = Fixture::new("");
        let index = fx.index();

        index.associate(&["k", "other"], &["t", "u"]).await.unwrap();
        index
            .disassociate(&[("k", vec!["t", "u"]), ("other", vec!["t"])])
            .await
            .unwrap();

        assert_eq!(fx.raw_members("t").await, None);
        assert_eq!(fx.raw_members("u").await, Some(vec!["other".to_string()]));
        assert!(index.resolve_keys(&["t"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disassociate_unknown_member_writes_nothing() {
        let fx = Fixture::new("");
        let index = fx.index();

        index.associate(&["k"], &["t"]).await.unwrap();
        let writes = fx.backend.writes.load(Ordering::SeqCst);

        index.disassociate(&[("stranger", vec!["t", "none"])]).await.unwrap();

        assert_eq!(fx.backend.writes.load(Ordering::SeqCst), writes);
        assert_eq!(fx.raw_members("t").await, Some(vec!["k".to_string()]));
        assert_eq!(fx.raw_members("none").await, None);
    }

    #[tokio::test]
    async fn test_stale_commits_last_writer_wins() {
        let fx = Fixture::new("");
        let index = fx.index();

        let mut first = index.fetch(&["t"]).await.unwrap();
        let mut second = index.fetch(&["t"]).await.unwrap();

        first.insert("t", "k1");
        second.insert("t", "k2");
        index.commit(first).await.unwrap();
        index.commit(second).await.unwrap();

        let members = index.resolve_keys(&["t"]).await.unwrap();
        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec!["k2".to_string()]);
    }

    #[tokio::test]
    async fn test_records_track_state() {
        let mut records = TagRecords::default();
        assert!(records.insert("t", "k"));
        assert!(!records.insert("t", "k"));
        assert!(!records.remove("missing", "k"));

        let record = records.get("t").unwrap();
        assert!(record.is_dirty());
        assert!(!record.existed());
        assert_eq!(records.tags().collect::<Vec<_>>(), vec!["t"]);
    }
}
