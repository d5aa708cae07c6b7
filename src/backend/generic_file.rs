//! Raw pages at URL-shaped paths.
//!
//! The body of `example.com/blog/_index_slash.html_gzip` is written
//! verbatim to `cache_dir/example.com/blog/_index_slash.html_gzip`, which a
//! front-end web server can map requests onto directly. Status, headers and
//! expiry go to a JSON sidecar next to it (`<file>.meta`) that only this
//! backend reads.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::file::{remove_if_exists, write_atomic};
use super::{current_millis, duration_millis, CachedPage, Lookup, PageStore};
use crate::compression::Compression;
use crate::error::CacheError;
use crate::key::Group;

const META_SUFFIX: &str = ".meta";

#[derive(Clone)]
pub struct GenericFileBackend {
    root: PathBuf,
    stale_retention: Duration,
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    status: u16,
    headers: Vec<(String, String)>,
    time: i64,
    expires_at_ms: u64,
    compression: Compression,
    has_dynamic: bool,
}

impl GenericFileBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            stale_retention: Duration::from_secs(3600),
        }
    }

    pub fn with_stale_retention(mut self, retention: Duration) -> Self {
        self.stale_retention = retention;
        self
    }

    fn paths_for(&self, key: &str, group: &Group) -> Result<(PathBuf, PathBuf), CacheError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(CacheError::Backend(format!("refusing unsafe page path `{key}`")));
        }

        let mut body = self.root.clone();
        if !group.is_default() {
            body.push(group.as_str());
        }
        body.push(relative);
        let mut meta = body.clone().into_os_string();
        meta.push(META_SUFFIX);
        Ok((body, PathBuf::from(meta)))
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl PageStore for GenericFileBackend {
    async fn get_with_staleness(&self, key: &str, group: &Group) -> Result<Option<Lookup>, CacheError> {
        let (body_path, meta_path) = self.paths_for(key, group)?;
        let Some(meta) = read_optional(&meta_path).await? else {
            return Ok(None);
        };
        let Some(body) = read_optional(&body_path).await? else {
            return Ok(None);
        };
        let sidecar: Sidecar =
            serde_json::from_slice(&meta).map_err(|err| CacheError::Codec(err.to_string()))?;

        let now = current_millis();
        if now > sidecar.expires_at_ms.saturating_add(duration_millis(self.stale_retention)) {
            remove_if_exists(&body_path).await?;
            remove_if_exists(&meta_path).await?;
            return Ok(None);
        }

        Ok(Some(Lookup {
            stale: now > sidecar.expires_at_ms,
            page: CachedPage {
                status: sidecar.status,
                headers: sidecar.headers,
                body: Bytes::from(body),
                time: sidecar.time,
                compression: sidecar.compression,
                has_dynamic: sidecar.has_dynamic,
            },
        }))
    }

    async fn set(&self, key: &str, group: &Group, page: &CachedPage, ttl: Duration) -> Result<bool, CacheError> {
        if ttl.is_zero() {
            return Ok(false);
        }
        let (body_path, meta_path) = self.paths_for(key, group)?;
        let sidecar = Sidecar {
            status: page.status,
            headers: page.headers.clone(),
            time: page.time,
            expires_at_ms: current_millis().saturating_add(duration_millis(ttl)),
            compression: page.compression,
            has_dynamic: page.has_dynamic,
        };
        let meta = serde_json::to_vec(&sidecar).map_err(|err| CacheError::Codec(err.to_string()))?;

        write_atomic(&body_path, &page.body).await?;
        write_atomic(&meta_path, &meta).await?;
        Ok(true)
    }

    async fn hard_delete(&self, key: &str, group: &Group) -> Result<bool, CacheError> {
        let (body_path, meta_path) = self.paths_for(key, group)?;
        let existed = remove_if_exists(&body_path).await?;
        remove_if_exists(&meta_path).await?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(compression: Compression, body: &'static [u8]) -> CachedPage {
        CachedPage {
            status: 200,
            headers: vec![("content-type".into(), "text/html; charset=UTF-8".into())],
            body: Bytes::from_static(body),
            time: 1_700_000_000,
            compression,
            has_dynamic: false,
        }
    }

    #[tokio::test]
    async fn body_is_written_verbatim_at_the_key_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = GenericFileBackend::new(dir.path());
        let key = "example.com/blog/_index_slash.html";

        backend
            .set(key, &Group::Default, &page(Compression::Identity, b"<html>hi</html>"), Duration::from_secs(60))
            .await
            .expect("set");

        let on_disk = std::fs::read(dir.path().join(key)).expect("raw page");
        assert_eq!(on_disk, b"<html>hi</html>");

        let cached = backend
            .get(key, &Group::Default)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(cached.headers[0].1, "text/html; charset=UTF-8");
    }

    #[tokio::test]
    async fn variants_do_not_overwrite_each_other() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = GenericFileBackend::new(dir.path());
        let plain = "example.com/_index_slash.html";
        let gzip = "example.com/_index_slash.html_gzip";

        backend
            .set(plain, &Group::Default, &page(Compression::Identity, b"plain"), Duration::from_secs(60))
            .await
            .expect("set plain");
        backend
            .set(gzip, &Group::Default, &page(Compression::Gzip, b"packed"), Duration::from_secs(60))
            .await
            .expect("set gzip");

        let plain_page = backend.get(plain, &Group::Default).await.expect("get").expect("plain");
        let gzip_page = backend.get(gzip, &Group::Default).await.expect("get").expect("gzip");
        assert_eq!(&plain_page.body[..], b"plain");
        assert_eq!(&gzip_page.body[..], b"packed");
        assert_eq!(gzip_page.compression, Compression::Gzip);
    }

    #[tokio::test]
    async fn traversal_keys_are_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = GenericFileBackend::new(dir.path());
        let result = backend
            .set("../outside.html", &Group::Default, &page(Compression::Identity, b"x"), Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(CacheError::Backend(_))));
        assert!(backend.get("/etc/passwd", &Group::Default).await.is_err());
    }
}
