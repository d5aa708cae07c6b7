use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use super::{current_millis, duration_millis, CachedPage, Lookup, PageStore, EXPIRED_DATA_GRACE};
use crate::error::CacheError;
use crate::key::Group;

/// An in-memory [`PageStore`] backed by [`moka`].
///
/// The backend is cheap to clone and shares a single underlying cache.
/// Capacity is counted in stored variants, not bytes.
#[derive(Clone)]
pub struct InMemoryBackend {
    cache: Cache<(Group, String), StoredEntry>,
    stale_retention: Duration,
    use_expired_data: bool,
}

#[derive(Clone)]
struct StoredEntry {
    page: CachedPage,
    expires_at_ms: u64,
}

impl InMemoryBackend {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder().max_capacity(max_capacity).build();
        Self {
            cache,
            stale_retention: Duration::from_secs(3600),
            use_expired_data: false,
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

    fn make_key(key: &str, group: &Group) -> (Group, String) {
        (group.clone(), key.to_owned())
    }
}

#[async_trait]
impl PageStore for InMemoryBackend {
    async fn get_with_staleness(&self, key: &str, group: &Group) -> Result<Option<Lookup>, CacheError> {
        let key = Self::make_key(key, group);
        let Some(stored) = self.cache.get(&key).await else {
            return Ok(None);
        };

        let now = current_millis();
        if now <= stored.expires_at_ms {
            return Ok(Some(Lookup {
                page: stored.page,
                stale: false,
            }));
        }

        if now > stored.expires_at_ms.saturating_add(duration_millis(self.stale_retention)) {
            self.cache.invalidate(&key).await;
            return Ok(None);
        }

        if self.use_expired_data {
            let extended = StoredEntry {
                page: stored.page.clone(),
                expires_at_ms: now.saturating_add(duration_millis(EXPIRED_DATA_GRACE)),
            };
            self.cache.insert(key, extended).await;
        }

        Ok(Some(Lookup {
            page: stored.page,
            stale: true,
        }))
    }

    async fn set(&self, key: &str, group: &Group, page: &CachedPage, ttl: Duration) -> Result<bool, CacheError> {
        if ttl.is_zero() {
            return Ok(false);
        }

        let stored = StoredEntry {
            page: page.clone(),
            expires_at_ms: current_millis().saturating_add(duration_millis(ttl)),
        };
        self.cache.insert(Self::make_key(key, group), stored).await;
        Ok(true)
    }

    async fn hard_delete(&self, key: &str, group: &Group) -> Result<bool, CacheError> {
        Ok(self.cache.remove(&Self::make_key(key, group)).await.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use bytes::Bytes;
    use tokio::time::sleep;

    fn page(body: &'static [u8]) -> CachedPage {
        CachedPage {
            status: 200,
            headers: vec![("content-type".into(), "text/html".into())],
            body: Bytes::from_static(body),
            time: 1_700_000_000,
            compression: Compression::Identity,
            has_dynamic: false,
        }
    }

    #[tokio::test]
    async fn set_and_get_returns_cached_page() {
        let backend = InMemoryBackend::new(16);
        let stored = page(b"alpha");

        assert!(backend
            .set("key", &Group::Default, &stored, Duration::from_secs(60))
            .await
            .expect("set succeeds"));

        let cached = backend
            .get("key", &Group::Default)
            .await
            .expect("get succeeds")
            .expect("page present");
        assert_eq!(cached, stored);
        assert!(backend
            .get("key", &Group::Rest)
            .await
            .expect("get succeeds")
            .is_none());
    }

    #[tokio::test]
    async fn expired_page_is_stale_until_retention_ends() {
        let backend = InMemoryBackend::new(16).with_stale_retention(Duration::from_millis(60));
        backend
            .set("key", &Group::Default, &page(b"old"), Duration::from_millis(20))
            .await
            .expect("set succeeds");

        sleep(Duration::from_millis(40)).await;
        let lookup = backend
            .get_with_staleness("key", &Group::Default)
            .await
            .expect("get succeeds")
            .expect("stale page kept");
        assert!(lookup.stale);
        assert!(backend.get("key", &Group::Default).await.expect("get").is_none());

        sleep(Duration::from_millis(80)).await;
        assert!(backend
            .get_with_staleness("key", &Group::Default)
            .await
            .expect("get succeeds")
            .is_none());
    }

    #[tokio::test]
    async fn expired_data_is_extended_for_other_readers() {
        let backend = InMemoryBackend::new(16).with_use_expired_data(true);
        backend
            .set("key", &Group::Default, &page(b"old"), Duration::from_millis(10))
            .await
            .expect("set succeeds");
        sleep(Duration::from_millis(30)).await;

        let first = backend
            .get_with_staleness("key", &Group::Default)
            .await
            .expect("get")
            .expect("present");
        assert!(first.stale, "the reader that finds it expired regenerates");

        let second = backend
            .get_with_staleness("key", &Group::Default)
            .await
            .expect("get")
            .expect("present");
        assert!(!second.stale, "later readers get the extended copy");
    }

    #[tokio::test]
    async fn hard_delete_reports_presence() {
        let backend = InMemoryBackend::new(16);
        backend
            .set("key", &Group::Default, &page(b"x"), Duration::from_secs(60))
            .await
            .expect("set");
        assert!(backend.hard_delete("key", &Group::Default).await.expect("delete"));
        assert!(!backend.hard_delete("key", &Group::Default).await.expect("delete"));
    }

    #[tokio::test]
    async fn groups_never_share_entries() {
        let backend = InMemoryBackend::new(16);
        let custom = Group::Custom("a:b".into());
        backend
            .set("c", &custom, &page(b"custom"), Duration::from_secs(60))
            .await
            .expect("set");
        backend
            .set("b:c", &Group::Custom("a".into()), &page(b"other"), Duration::from_secs(60))
            .await
            .expect("set");

        let stored = backend.get("c", &custom).await.expect("get").expect("present");
        assert_eq!(stored.body, Bytes::from_static(b"custom"));
        assert!(backend.get("c", &Group::Default).await.expect("get").is_none());
    }
}
