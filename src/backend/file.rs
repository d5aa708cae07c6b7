//! Hash-keyed page records on local disk.
//!
//! A record for `key` in `group` lives at
//! `cache_dir/group/aaa/bbb/<sha256(key)>`, where `aaa` and `bbb` are the
//! first two triples of the digest. Writes go to a temporary sibling and
//! are renamed into place, so readers never observe a partial record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{CachedPage, Envelope, Lookup, PageStore};
use crate::codec::{BincodeCodec, PageCodec};
use crate::error::CacheError;
use crate::key::Group;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct FileBackend<C = BincodeCodec> {
    root: PathBuf,
    codec: C,
    stale_retention: Duration,
    use_expired_data: bool,
}

impl FileBackend<BincodeCodec> {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            codec: BincodeCodec,
            stale_retention: Duration::from_secs(3600),
            use_expired_data: false,
        }
    }
}

impl<C> FileBackend<C> {
    pub fn with_codec<NC>(self, codec: NC) -> FileBackend<NC> {
        FileBackend {
            root: self.root,
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

    fn path_for(&self, key: &str, group: &Group) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        let mut path = self.root.clone();
        if !group.is_default() {
            path.push(group.as_str());
        }
        path.push(&digest[0..3]);
        path.push(&digest[3..6]);
        path.push(&digest);
        path
    }
}

/// Writes `bytes` to `path` through a temporary file and a rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut temp = path.as_os_str().to_owned();
    temp.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let temp = PathBuf::from(temp);
    if let Err(err) = tokio::fs::write(&temp, bytes).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(err.into());
    }
    if let Err(err) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(err.into());
    }
    Ok(())
}

/// Removes `path`, reporting whether it existed.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<bool, CacheError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl<C> PageStore for FileBackend<C>
where
    C: PageCodec,
{
    async fn get_with_staleness(&self, key: &str, group: &Group) -> Result<Option<Lookup>, CacheError> {
        let path = self.path_for(key, group);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut envelope = Envelope::from_bytes(&bytes)?;
        if envelope.is_dead(self.stale_retention) {
            remove_if_exists(&path).await?;
            return Ok(None);
        }

        let page = self.codec.decode(&envelope.payload)?;
        let stale = envelope.is_expired();
        if stale && self.use_expired_data {
            envelope.extend_for_grace();
            if let Err(err) = write_atomic(&path, &envelope.to_bytes()?).await {
                tracing::debug!(path = %path.display(), error = %err, "failed to extend expired page");
            }
        }

        Ok(Some(Lookup { page, stale }))
    }

    async fn set(&self, key: &str, group: &Group, page: &CachedPage, ttl: Duration) -> Result<bool, CacheError> {
        if ttl.is_zero() {
            return Ok(false);
        }
        let envelope = Envelope::seal(&self.codec, page, ttl)?;
        write_atomic(&self.path_for(key, group), &envelope.to_bytes()?).await?;
        Ok(true)
    }

    async fn hard_delete(&self, key: &str, group: &Group) -> Result<bool, CacheError> {
        remove_if_exists(&self.path_for(key, group)).await
    }
}
