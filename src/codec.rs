use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::backend::CachedPage;
use crate::compression::Compression;
use crate::error::CacheError;

/// Serialization strategy for stored pages.
pub trait PageCodec: Send + Sync + Clone + 'static {
    fn encode(&self, page: &CachedPage) -> Result<Vec<u8>, CacheError>;
    fn decode(&self, bytes: &[u8]) -> Result<CachedPage, CacheError>;
}

/// Default [`PageCodec`] implementation backed by `bincode`.
#[derive(Debug, Clone, Default)]
pub struct BincodeCodec;

#[derive(Serialize, Deserialize)]
struct StoredPage {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    time: i64,
    compression: Compression,
    has_dynamic: bool,
}

impl PageCodec for BincodeCodec {
    fn encode(&self, page: &CachedPage) -> Result<Vec<u8>, CacheError> {
        let stored = StoredPage {
            status: page.status,
            headers: page.headers.clone(),
            body: page.body.to_vec(),
            time: page.time,
            compression: page.compression,
            has_dynamic: page.has_dynamic,
        };

        bincode::serialize(&stored).map_err(|err| CacheError::Codec(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<CachedPage, CacheError> {
        let stored: StoredPage =
            bincode::deserialize(bytes).map_err(|err| CacheError::Codec(err.to_string()))?;
        if !(100..=999).contains(&stored.status) {
            return Err(CacheError::Codec(format!("invalid status {}", stored.status)));
        }
        Ok(CachedPage {
            status: stored.status,
            headers: stored.headers,
            body: Bytes::from(stored.body),
            time: stored.time,
            compression: stored.compression,
            has_dynamic: stored.has_dynamic,
        })
    }
}
