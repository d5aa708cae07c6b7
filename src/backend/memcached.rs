//! Memcached page store.
//!
//! In the default mode records are namespaced and carry an expiry envelope
//! like every other byte-oriented engine. In raw mode (the
//! `nginx_memcached` engine) the body alone is stored under the bare page
//! key, so an nginx `memcached_pass` location can answer requests straight
//! from Memcached. Raw entries rely on Memcached's own expiry and are
//! never reported stale.
//!
//! ```no_run
//! use tower_page_cache::backend::memcached::MemcachedBackend;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = MemcachedBackend::new("127.0.0.1:11211")
//!     .await?
//!     .with_namespace("site_a");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_memcached::{AsciiProtocol, Client};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::{native_ttl, CachedPage, Envelope, Lookup, PageStore, EXPIRED_DATA_GRACE};
use crate::codec::{BincodeCodec, PageCodec};
use crate::compression::Compression;
use crate::config::MemcachedEngineConfig;
use crate::error::CacheError;
use crate::key::Group;

#[derive(Clone)]
pub struct MemcachedBackend {
    client: Arc<Mutex<Client>>,
    namespace: String,
    codec: BincodeCodec,
    raw: bool,
    stale_retention: Duration,
    use_expired_data: bool,
}

impl MemcachedBackend {
    /// Connects to a single server.
    pub async fn new(server: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = Client::new(server.as_ref())
            .await
            .map_err(|e| CacheError::Backend(format!("Failed to connect to Memcached: {}", e)))?;

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            namespace: "page_cache".to_owned(),
            codec: BincodeCodec,
            raw: false,
            stale_retention: Duration::from_secs(3600),
            use_expired_data: false,
        })
    }

    /// Connects to the first configured server within the configured
    /// timeout.
    pub async fn connect(config: &MemcachedEngineConfig) -> Result<Self, CacheError> {
        let server = config
            .servers
            .first()
            .ok_or_else(|| CacheError::Config("no memcached server configured".to_owned()))?;
        if config.username.is_some() {
            tracing::warn!(server = %server, "memcached SASL credentials are not supported, connecting without");
        }
        let backend = tokio::time::timeout(config.timeout, Self::new(server))
            .await
            .map_err(|_| CacheError::Backend(format!("timed out connecting to memcached at {server}")))??;
        Ok(backend.with_namespace(config.namespace.clone()))
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Switches to raw body storage under unprefixed keys.
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn with_stale_retention(mut self, retention: Duration) -> Self {
        self.stale_retention = retention;
        self
    }

    pub fn with_use_expired_data(mut self, enabled: bool) -> Self {
        self.use_expired_data = enabled;
        self
    }

    fn make_key(&self, key: &str, group: &Group) -> String {
        if self.raw {
            key.to_owned()
        } else {
            format!("{}:{}:{}", self.namespace, group.as_str(), key)
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut client = self.client.lock().await;
        let value = client
            .get(key.as_bytes())
            .await
            .map_err(|e| CacheError::Backend(format!("Memcached get failed: {}", e)))?;
        Ok(value.and_then(|value| value.data))
    }

    async fn store(&self, key: &str, bytes: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let ttl_secs = ttl.as_secs().clamp(1, u32::MAX as u64) as i64;
        let mut client = self.client.lock().await;
        client
            .set(key.as_bytes(), bytes, Some(ttl_secs), Default::default())
            .await
            .map_err(|e| CacheError::Backend(format!("Memcached set failed: {}", e)))
    }
}

/// Compression of a raw entry, recovered from its key suffix.
fn raw_compression(key: &str) -> Compression {
    [Compression::Gzip, Compression::Deflate, Compression::Brotli]
        .into_iter()
        .find(|scheme| key.ends_with(scheme.key_suffix()))
        .unwrap_or(Compression::Identity)
}

#[async_trait]
impl PageStore for MemcachedBackend {
    async fn get_with_staleness(&self, key: &str, group: &Group) -> Result<Option<Lookup>, CacheError> {
        let storage_key = self.make_key(key, group);
        let Some(bytes) = self.fetch(&storage_key).await? else {
            return Ok(None);
        };

        if self.raw {
            return Ok(Some(Lookup {
                page: CachedPage {
                    status: 200,
                    headers: Vec::new(),
                    body: Bytes::from(bytes),
                    time: crate::conditional::unix_now(),
                    compression: raw_compression(key),
                    has_dynamic: false,
                },
                stale: false,
            }));
        }

        let mut envelope = Envelope::from_bytes(&bytes)?;
        let page = self.codec.decode(&envelope.payload)?;
        let stale = envelope.is_expired();
        if stale && self.use_expired_data {
            envelope.extend_for_grace();
            self.store(
                &storage_key,
                &envelope.to_bytes()?,
                native_ttl(EXPIRED_DATA_GRACE, self.stale_retention),
            )
            .await?;
        }

        Ok(Some(Lookup { page, stale }))
    }

    async fn set(&self, key: &str, group: &Group, page: &CachedPage, ttl: Duration) -> Result<bool, CacheError> {
        if ttl.is_zero() {
            return Ok(false);
        }

        let storage_key = self.make_key(key, group);
        if self.raw {
            self.store(&storage_key, &page.body, ttl).await?;
        } else {
            let bytes = Envelope::seal(&self.codec, page, ttl)?.to_bytes()?;
            self.store(&storage_key, &bytes, native_ttl(ttl, self.stale_retention))
                .await?;
        }
        Ok(true)
    }

    async fn hard_delete(&self, key: &str, group: &Group) -> Result<bool, CacheError> {
        let storage_key = self.make_key(key, group);
        if self.fetch(&storage_key).await?.is_none() {
            return Ok(false);
        }
        let mut client = self.client.lock().await;
        client
            .delete(storage_key.as_bytes())
            .await
            .map_err(|e| CacheError::Backend(format!("Memcached delete failed: {}", e)))?;
        Ok(true)
    }
}
