//! Storage engines for cached pages.
//!
//! Every engine implements [`PageStore`]:
//! - [`memory::InMemoryBackend`]: process-local, backed by [`moka`].
//! - [`file::FileBackend`]: hash-keyed records on local disk.
//! - [`generic_file::GenericFileBackend`]: raw pages at URL-shaped paths, so
//!   a web server can serve them without calling the application.
//! - `redis::RedisBackend` *(feature `redis-backend`)*.
//! - `memcached::MemcachedBackend` *(feature `memcached-backend`)*, which
//!   also provides the raw mode read by an nginx memcached module.
//!
//! Records carry their own expiry. An expired record is kept for a
//! retention window and reported as stale, so callers can clean up old
//! variants or, when configured, serve it while a fresh copy is generated.

pub mod file;
pub mod generic_file;
#[cfg(feature = "memcached-backend")]
pub mod memcached;
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::codec::PageCodec;
use crate::compression::Compression;
use crate::config::{Engine, PageCacheConfig};
use crate::error::CacheError;
use crate::key::Group;

/// How long an expired record is handed to other readers as fresh while
/// the request that found it regenerates the page.
pub(crate) const EXPIRED_DATA_GRACE: Duration = Duration::from_secs(30);

/// One stored variant of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPage {
    pub status: u16,
    /// Allow-listed response headers in emission order. Repeating headers
    /// appear once per value.
    pub headers: Vec<(String, String)>,
    /// Body encoded with `compression`.
    pub body: Bytes,
    /// Creation time, seconds since the epoch.
    pub time: i64,
    pub compression: Compression,
    pub has_dynamic: bool,
}

impl CachedPage {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    pub fn is_404(&self) -> bool {
        self.status == StatusCode::NOT_FOUND.as_u16()
    }
}

/// Result of [`PageStore::get_with_staleness`].
#[derive(Debug, Clone)]
pub struct Lookup {
    pub page: CachedPage,
    /// The record outlived its TTL and is not authoritative.
    pub stale: bool,
}

#[async_trait]
pub trait PageStore: Send + Sync + 'static {
    /// Fetches a fresh record. Stale records read as absent.
    async fn get(&self, key: &str, group: &Group) -> Result<Option<CachedPage>, CacheError> {
        Ok(self
            .get_with_staleness(key, group)
            .await?
            .filter(|lookup| !lookup.stale)
            .map(|lookup| lookup.page))
    }

    /// Fetches a record, reporting whether it has expired.
    async fn get_with_staleness(&self, key: &str, group: &Group) -> Result<Option<Lookup>, CacheError>;

    /// Stores `page` for `ttl`. Returns `false` when nothing was written.
    async fn set(&self, key: &str, group: &Group, page: &CachedPage, ttl: Duration) -> Result<bool, CacheError>;

    /// Removes a record outright, ignoring any stale retention. Returns
    /// whether a record existed.
    async fn hard_delete(&self, key: &str, group: &Group) -> Result<bool, CacheError>;
}

#[async_trait]
impl<T> PageStore for Arc<T>
where
    T: PageStore + ?Sized,
{
    async fn get(&self, key: &str, group: &Group) -> Result<Option<CachedPage>, CacheError> {
        (**self).get(key, group).await
    }

    async fn get_with_staleness(&self, key: &str, group: &Group) -> Result<Option<Lookup>, CacheError> {
        (**self).get_with_staleness(key, group).await
    }

    async fn set(&self, key: &str, group: &Group, page: &CachedPage, ttl: Duration) -> Result<bool, CacheError> {
        (**self).set(key, group, page, ttl).await
    }

    async fn hard_delete(&self, key: &str, group: &Group) -> Result<bool, CacheError> {
        (**self).hard_delete(key, group).await
    }
}

/// Builds the engine selected by `pgcache.engine`.
pub async fn build_store(config: &PageCacheConfig) -> Result<Arc<dyn PageStore>, CacheError> {
    let engines = &config.engines;
    let store: Arc<dyn PageStore> = match config.engine {
        Engine::Memory => Arc::new(
            memory::InMemoryBackend::new(engines.memory_capacity)
                .with_stale_retention(engines.stale_retention)
                .with_use_expired_data(engines.use_expired_data),
        ),
        Engine::File => Arc::new(
            file::FileBackend::new(&engines.file.cache_dir)
                .with_stale_retention(engines.stale_retention)
                .with_use_expired_data(engines.use_expired_data),
        ),
        Engine::FileGeneric => Arc::new(
            generic_file::GenericFileBackend::new(&engines.file.cache_dir)
                .with_stale_retention(engines.stale_retention),
        ),
        #[cfg(feature = "redis-backend")]
        Engine::Redis => Arc::new(
            redis::RedisBackend::connect(&engines.redis)
                .await?
                .with_stale_retention(engines.stale_retention)
                .with_use_expired_data(engines.use_expired_data),
        ),
        #[cfg(feature = "memcached-backend")]
        Engine::Memcached => Arc::new(
            memcached::MemcachedBackend::connect(&engines.memcached)
                .await?
                .with_stale_retention(engines.stale_retention)
                .with_use_expired_data(engines.use_expired_data),
        ),
        #[cfg(feature = "memcached-backend")]
        Engine::NginxMemcached => Arc::new(memcached::MemcachedBackend::connect(&engines.memcached).await?.raw()),
        #[allow(unreachable_patterns)]
        other => {
            return Err(CacheError::Config(format!(
                "engine {other:?} is not compiled in; enable the matching crate feature"
            )))
        }
    };
    tracing::debug!(engine = ?config.engine, "page cache store ready");
    Ok(store)
}

/// Serialized record for byte-oriented engines: the encoded page plus its
/// expiry, so staleness survives the round trip.
#[derive(Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub(crate) expires_at_ms: u64,
    pub(crate) payload: Vec<u8>,
}

impl Envelope {
    pub(crate) fn seal<C: PageCodec>(codec: &C, page: &CachedPage, ttl: Duration) -> Result<Self, CacheError> {
        Ok(Self {
            expires_at_ms: current_millis().saturating_add(duration_millis(ttl)),
            payload: codec.encode(page)?,
        })
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        bincode::serialize(self).map_err(|err| CacheError::Codec(err.to_string()))
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        bincode::deserialize(bytes).map_err(|err| CacheError::Codec(err.to_string()))
    }

    pub(crate) fn is_expired(&self) -> bool {
        current_millis() > self.expires_at_ms
    }

    /// Past expiry and past the retention window as well.
    pub(crate) fn is_dead(&self, retention: Duration) -> bool {
        current_millis() > self.expires_at_ms.saturating_add(duration_millis(retention))
    }

    /// Pushes expiry forward so concurrent readers keep using this record.
    pub(crate) fn extend_for_grace(&mut self) {
        self.expires_at_ms = current_millis().saturating_add(duration_millis(EXPIRED_DATA_GRACE));
    }
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_millis)
        .unwrap_or_default()
}

/// Lifetime a backend with native expiry should give a record.
pub(crate) fn native_ttl(ttl: Duration, retention: Duration) -> Duration {
    ttl.saturating_add(retention)
}
