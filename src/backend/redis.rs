use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use super::{native_ttl, CachedPage, Envelope, Lookup, PageStore};
use crate::codec::{BincodeCodec, PageCodec};
use crate::config::RedisEngineConfig;
use crate::error::CacheError;
use crate::key::Group;

#[derive(Clone)]
pub struct RedisBackend<C = BincodeCodec> {
    connection: Arc<Mutex<ConnectionManager>>,
    namespace: String,
    codec: C,
    stale_retention: Duration,
    use_expired_data: bool,
}

impl RedisBackend<BincodeCodec> {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection: Arc::new(Mutex::new(connection)),
            namespace: "page_cache".to_owned(),
            codec: BincodeCodec,
            stale_retention: Duration::from_secs(3600),
            use_expired_data: false,
        }
    }

    /// Opens a managed connection to the first configured server.
    pub async fn connect(config: &RedisEngineConfig) -> Result<Self, CacheError> {
        let server = config
            .servers
            .first()
            .ok_or_else(|| CacheError::Config("no redis server configured".to_owned()))?;
        let client = redis::Client::open(connection_url(config, server))?;
        let connection = tokio::time::timeout(config.timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Backend(format!("timed out connecting to redis at {server}")))??;
        Ok(Self::new(connection).with_namespace(config.namespace.clone()))
    }
}

fn connection_url(config: &RedisEngineConfig, server: &str) -> String {
    let (scheme, address) = match server.split_once("://") {
        Some(("tls", rest)) | Some(("rediss", rest)) => ("rediss", rest),
        Some((_, rest)) => ("redis", rest),
        None => ("redis", server),
    };
    let auth = config
        .password
        .as_deref()
        .map(|password| format!(":{}@", urlencoding::encode(password)))
        .unwrap_or_default();
    let mut url = format!("{scheme}://{auth}{address}/{}", config.database);
    if scheme == "rediss" && !config.verify_tls {
        url.push_str("#insecure");
    }
    url
}

impl<C> RedisBackend<C> {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_codec<NC>(self, codec: NC) -> RedisBackend<NC> {
        RedisBackend {
            connection: self.connection,
            namespace: self.namespace,
            codec,
            stale_retention: self.stale_retention,
            use_expired_data: self.use_expired_data,
        }
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
        format!("{}:{}:{}", self.namespace, group.as_str(), key)
    }
}

#[async_trait]
impl<C> PageStore for RedisBackend<C>
where
    C: PageCodec,
{
    async fn get_with_staleness(&self, key: &str, group: &Group) -> Result<Option<Lookup>, CacheError> {
        let key = self.make_key(key, group);
        let mut conn = self.connection.lock().await;
        let data: Option<Vec<u8>> = conn.get(&key).await?;

        let Some(bytes) = data else {
            return Ok(None);
        };
        let mut envelope = Envelope::from_bytes(&bytes)?;
        let page = self.codec.decode(&envelope.payload)?;
        let stale = envelope.is_expired();

        if stale && self.use_expired_data {
            envelope.extend_for_grace();
            let ttl = native_ttl(super::EXPIRED_DATA_GRACE, self.stale_retention);
            let _: () = conn.set_ex(&key, envelope.to_bytes()?, ttl.as_secs().max(1)).await?;
        }

        Ok(Some(Lookup { page, stale }))
    }

    async fn set(&self, key: &str, group: &Group, page: &CachedPage, ttl: Duration) -> Result<bool, CacheError> {
        if ttl.is_zero() {
            return Ok(false);
        }

        let bytes = Envelope::seal(&self.codec, page, ttl)?.to_bytes()?;
        let ttl_secs = native_ttl(ttl, self.stale_retention).as_secs().max(1);

        let mut conn = self.connection.lock().await;
        let _: () = conn.set_ex(self.make_key(key, group), bytes, ttl_secs).await?;
        Ok(true)
    }

    async fn hard_delete(&self, key: &str, group: &Group) -> Result<bool, CacheError> {
        let mut conn = self.connection.lock().await;
        let removed: u64 = conn.del(self.make_key(key, group)).await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_urls_carry_auth_database_and_tls() {
        let mut config = RedisEngineConfig {
            password: Some("p@ss".into()),
            database: 3,
            ..RedisEngineConfig::default()
        };
        assert_eq!(
            connection_url(&config, "127.0.0.1:6379"),
            "redis://:p%40ss@127.0.0.1:6379/3"
        );

        config.password = None;
        config.verify_tls = false;
        assert_eq!(
            connection_url(&config, "tls://cache.internal:6380"),
            "rediss://cache.internal:6380/3#insecure"
        );
    }
}
