//! Re-exports for consumers who prefer a single import.
//!
//! ```no_run
//! use tower_page_cache::prelude::*;
//! # let backend = InMemoryBackend::new(128);
//! let layer = PageCacheLayer::builder(backend)
//!     .config(PageCacheConfig::default().with_gzip(true))
//!     .build();
//! ```

pub use crate::backend::file::FileBackend;
pub use crate::backend::generic_file::GenericFileBackend;
#[cfg(feature = "memcached-backend")]
pub use crate::backend::memcached::MemcachedBackend;
pub use crate::backend::memory::InMemoryBackend;
#[cfg(feature = "redis-backend")]
pub use crate::backend::redis::RedisBackend;
pub use crate::backend::{build_store, CachedPage, Lookup, PageStore};
pub use crate::codec::{BincodeCodec, PageCodec};
pub use crate::compression::Compression;
pub use crate::config::{BrowserCachePolicy, ConfigSource, Engine, JsonConfig, PageCacheConfig};
pub use crate::dynamic::FragmentRegistry;
pub use crate::error::CacheError;
pub use crate::hooks::Hooks;
pub use crate::key::{Group, KeyExtension};
pub use crate::layer::{PageCacheLayer, PageCacheLayerBuilder, DEFAULT_CACHE_STATUS_HEADER};
pub use crate::logging::LoggingConfig;
pub use crate::request::{ExecutionContext, PageFacts, RequestFacts};
pub use crate::telemetry::ProcessStatus;
