// memtag - tag-indexed caching for memcache-style backends
//
// This library bundles the cache facade with the logging macros it reports
// through.

// Re-export the cache crate
pub use memtag_cache::*;

// Re-export logging
pub use memtag_log as log;

/// Prelude for common imports.
///
/// ```
/// use memtag::prelude::*;
/// ```
pub mod prelude {
    pub use memtag_cache::prelude::*;
    pub use memtag_cache::{JsonSerializer, Serializer, TagIndex};
}
