//! Tag-indexed caching for memcache-style backends.
//!
//! Memcached offers a flat namespace of blobs with `get`, `set`, `delete`
//! and `flush`. This crate adds:
//!
//! - **Tag-based invalidation** - every key can carry tags, and
//!   [`TaggedCache::delete_by_tags`] removes everything tagged with any of them
//! - **Server pools** - host/weight and port specifications resolved into an
//!   ordered server list at connect time
//! - **One failure policy** - backend failures degrade to no-op results in
//!   production and surface as errors in development
//!
//! # Features
//!
//! - `memcached` - Enable the Memcached backend (requires explicit opt-in)
//! - `memcached-tls` - Memcached over TLS (requires openssl)
//!
//! # Examples
//!
//! ## Tag-based Invalidation
//!
//! ```
//! use memtag_cache::*;
//!
//! # async fn example() -> CacheResult<()> {
//! let config = ConnectionConfig::builder()
//!     .name("default")
//!     .database("myapp")
//!     .build()?;
//! let cache = TaggedCache::new(InMemoryBackend::new(), config);
//!
//! cache.save("user:1", &"Alice", None, &["users", "active-users"]).await?;
//! cache.save("user:2", &"Bob", None, &["users"]).await?;
//!
//! // Invalidate all entries with the "users" tag
//! cache.delete_by_tag("users").await?;
//! assert_eq!(cache.has_multiple(&["user:1", "user:2"]).await?, 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Memcached Pool (requires `memcached` feature)
//!
//! ```ignore
//! use memtag_cache::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CacheError> {
//!     let config = ConnectionConfig::builder()
//!         .hosts(HostSpec::weighted([("10.0.0.1", 1), ("10.0.0.2", 2)]))
//!         .port(11211)
//!         .timeout(Duration::from_millis(250))
//!         .build()?;
//!     let cache = TaggedCache::new(MemcachedBackend::new(), config);
//!
//!     cache.save("key", &"value", Some(Duration::from_secs(60)), &["tag"]).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod memory;
pub mod registry;
pub mod servers;
pub mod traits;

#[cfg(feature = "memcached")]
pub mod memcached;

pub use cache::{ConnectionState, ErrorHook, TaggedCache};
pub use codec::{Codec, JsonSerializer, Serializer};
pub use config::{ConnectionConfig, ConnectionConfigBuilder, ExecutionMode, ProviderOptions};
pub use error::{CacheError, CacheResult};
pub use invalidation::{KeySpace, TAG_NAMESPACE, TagIndex, TagRecord, TagRecords};
pub use memory::InMemoryBackend;
pub use registry::CacheRegistry;
pub use servers::{HostSpec, PortSpec, ServerEndpoint};
pub use traits::CacheBackend;

#[cfg(feature = "memcached")]
pub use memcached::MemcachedBackend;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{ConnectionState, TaggedCache};
    pub use crate::config::{ConnectionConfig, ExecutionMode};
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::memory::InMemoryBackend;
    pub use crate::registry::CacheRegistry;
    pub use crate::servers::{HostSpec, PortSpec};
    pub use crate::traits::CacheBackend;

    #[cfg(feature = "memcached")]
    pub use crate::memcached::MemcachedBackend;
}
