//! Compression variants of a cached page.
//!
//! Each variant is stored under its own key. [`compressions_to_store`]
//! decides which variants a capture writes and [`negotiate`] picks the
//! one a client receives.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::PageCacheConfig;
use crate::error::CacheError;

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

/// Encoding of a stored body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Compression {
    #[default]
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl Compression {
    /// Label used in logs and in the key extension.
    pub fn label(self) -> &'static str {
        match self {
            Self::Identity => "",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Brotli => "br",
        }
    }

    pub fn key_suffix(self) -> &'static str {
        match self {
            Self::Identity => "",
            Self::Gzip => "_gzip",
            Self::Deflate => "_deflate",
            Self::Brotli => "_br",
        }
    }

    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Self::Identity => None,
            other => Some(other.label()),
        }
    }

    pub fn is_identity(self) -> bool {
        self == Self::Identity
    }

    pub fn compress(self, body: &[u8]) -> Result<Bytes, CacheError> {
        let encoded = match self {
            Self::Identity => return Ok(Bytes::copy_from_slice(body)),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(body)?;
                encoder.finish()?
            }
            Self::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(body)?;
                encoder.finish()?
            }
            Self::Brotli => {
                let mut output = Vec::new();
                {
                    let mut writer = brotli::CompressorWriter::new(
                        &mut output,
                        BROTLI_BUFFER,
                        BROTLI_QUALITY,
                        BROTLI_WINDOW,
                    );
                    writer.write_all(body)?;
                    writer.flush()?;
                }
                output
            }
        };
        Ok(Bytes::from(encoded))
    }

    pub fn decompress(self, body: &[u8]) -> Result<Bytes, CacheError> {
        let mut decoded = Vec::new();
        match self {
            Self::Identity => return Ok(Bytes::copy_from_slice(body)),
            Self::Gzip => {
                GzDecoder::new(body).read_to_end(&mut decoded)?;
            }
            Self::Deflate => {
                DeflateDecoder::new(body).read_to_end(&mut decoded)?;
            }
            Self::Brotli => {
                brotli::Decompressor::new(body, BROTLI_BUFFER).read_to_end(&mut decoded)?;
            }
        }
        Ok(Bytes::from(decoded))
    }

    fn accept_token(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            other => other.label(),
        }
    }
}

/// Non-identity schemes enabled by configuration, in preference order.
pub fn enabled_compressions(config: &PageCacheConfig) -> Vec<Compression> {
    if !config.compression_allowed() {
        return Vec::new();
    }
    let mut schemes = Vec::new();
    if config.browser.gzip {
        schemes.push(Compression::Gzip);
    }
    if config.browser.deflate {
        schemes.push(Compression::Deflate);
    }
    if config.browser.brotli {
        schemes.push(Compression::Brotli);
    }
    schemes
}

/// Variants a capture must persist. Identity always comes first; pages with
/// dynamic fragments are stored identity-only and compressed at send time.
pub fn compressions_to_store(config: &PageCacheConfig, has_dynamic: bool) -> Vec<Compression> {
    let mut schemes = vec![Compression::Identity];
    if !has_dynamic {
        schemes.extend(enabled_compressions(config));
    }
    schemes
}

/// Picks the variant for a client: the first enabled scheme listed in its
/// `Accept-Encoding` with a non-zero quality, or identity.
pub fn negotiate(accept_encoding: &str, user_agent: &str, config: &PageCacheConfig) -> Compression {
    if is_buggy_ie(user_agent) {
        return Compression::Identity;
    }
    let accepted = accepted_encodings(accept_encoding);
    enabled_compressions(config)
        .into_iter()
        .find(|scheme| accepted.iter().any(|token| token == scheme.accept_token()))
        .unwrap_or(Compression::Identity)
}

fn accepted_encodings(header: &str) -> Vec<String> {
    header
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(';');
            let token = parts.next()?.trim().to_ascii_lowercase();
            if token.is_empty() {
                return None;
            }
            let refused = parts.any(|param| {
                param
                    .trim()
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            let token = match token.as_str() {
                "x-gzip" => "gzip".to_owned(),
                _ => token,
            };
            (!refused).then_some(token)
        })
        .collect()
}

/// MSIE before 6, or MSIE 6 without SV1, mishandles compressed pages.
pub fn is_buggy_ie(user_agent: &str) -> bool {
    let Some(idx) = user_agent.find("MSIE ") else {
        return false;
    };
    let version: String = user_agent[idx + 5..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    match version.parse::<u32>() {
        Ok(major) if major < 6 => true,
        Ok(6) => !user_agent.contains("SV1"),
        _ => false,
    }
}

/// Strong validator for a body: hex SHA-256 truncated to 128 bits.
pub fn etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PageCacheConfig {
        PageCacheConfig::default().with_gzip(true).with_brotli(true)
    }

    #[test]
    fn every_scheme_restores_the_original_bytes() {
        let body = b"<html><body>hello hello hello</body></html>";
        for scheme in [
            Compression::Identity,
            Compression::Gzip,
            Compression::Deflate,
            Compression::Brotli,
        ] {
            let packed = scheme.compress(body).expect("compress");
            let unpacked = scheme.decompress(&packed).expect("decompress");
            assert_eq!(&unpacked[..], &body[..], "{scheme:?}");
        }
    }

    #[test]
    fn store_set_collapses_for_debug_and_dynamic_pages() {
        assert_eq!(
            compressions_to_store(&config(), false),
            vec![Compression::Identity, Compression::Gzip, Compression::Brotli]
        );
        assert_eq!(compressions_to_store(&config(), true), vec![Compression::Identity]);
        assert_eq!(
            compressions_to_store(&config().with_debug(true), false),
            vec![Compression::Identity]
        );
    }

    #[test]
    fn negotiation_prefers_configured_order() {
        let cfg = config();
        assert_eq!(negotiate("br, gzip", "", &cfg), Compression::Gzip);
        assert_eq!(negotiate("br", "", &cfg), Compression::Brotli);
        assert_eq!(negotiate("gzip;q=0, br", "", &cfg), Compression::Brotli);
        assert_eq!(negotiate("deflate", "", &cfg), Compression::Identity);
        assert_eq!(negotiate("", "", &cfg), Compression::Identity);
        assert_eq!(
            negotiate("gzip", "", &PageCacheConfig::default().with_gzip(false)),
            Compression::Identity
        );
    }

    #[test]
    fn old_internet_explorer_gets_identity() {
        let cfg = config();
        assert!(is_buggy_ie("Mozilla/4.0 (compatible; MSIE 5.5; Windows NT 5.0)"));
        assert!(is_buggy_ie("Mozilla/4.0 (compatible; MSIE 6.0; Windows NT 5.1)"));
        assert!(!is_buggy_ie("Mozilla/4.0 (compatible; MSIE 6.0; Windows NT 5.1; SV1)"));
        assert!(!is_buggy_ie("Mozilla/5.0 (compatible; MSIE 10.0)"));
        assert_eq!(
            negotiate("gzip", "Mozilla/4.0 (compatible; MSIE 5.0)", &cfg),
            Compression::Identity
        );
    }

    #[test]
    fn etag_tracks_content() {
        assert_eq!(etag(b"a"), etag(b"a"));
        assert_ne!(etag(b"a"), etag(b"b"));
        assert_eq!(etag(b"a").len(), 32);
    }
}
