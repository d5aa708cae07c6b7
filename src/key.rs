//! Cache key derivation.
//!
//! A key is `urlpart + extension + postfix + compression suffix`. The
//! extension encodes every variant axis of the request (device class,
//! referrer class, cookie group, encryption, preview) as tagged,
//! escaped fields, so two distinct extensions can never render the same
//! string.

use sha2::{Digest, Sha256};

use crate::compression::{self, Compression};
use crate::config::PageCacheConfig;
use crate::request::RequestContext;

/// Key space partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Group {
    #[default]
    Default,
    Sitemaps,
    Rest,
    Custom(String),
}

impl Group {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Default => "",
            Self::Sitemaps => "sitemaps",
            Self::Rest => "rest",
            Self::Custom(name) => name,
        }
    }

    pub fn is_default(&self) -> bool {
        self.as_str().is_empty()
    }
}

/// Variant axes of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExtension {
    pub useragent: String,
    pub referrer: String,
    pub cookie: String,
    pub encryption: String,
    pub compression: Compression,
    pub content_type: String,
    pub preview: bool,
    pub cache: bool,
    pub reason: String,
    pub group: Group,
}

impl Default for KeyExtension {
    fn default() -> Self {
        Self {
            useragent: String::new(),
            referrer: String::new(),
            cookie: String::new(),
            encryption: String::new(),
            compression: Compression::Identity,
            content_type: String::new(),
            preview: false,
            cache: true,
            reason: String::new(),
            group: Group::Default,
        }
    }
}

impl KeyExtension {
    pub fn with_compression(&self, compression: Compression) -> Self {
        Self {
            compression,
            ..self.clone()
        }
    }

    /// The extension string placed between the URL part and the postfix.
    pub fn suffix(&self) -> String {
        let mut out = String::new();
        push_field(&mut out, "ua.", &self.useragent);
        push_field(&mut out, "ref.", &self.referrer);
        push_field(&mut out, "cg.", &self.cookie);
        if self.encryption == "ssl" {
            out.push_str("_ssl");
        } else {
            push_field(&mut out, "enc.", &self.encryption);
        }
        if self.preview {
            out.push_str("_preview");
        }
        out
    }
}

fn push_field(out: &mut String, tag: &str, label: &str) {
    if label.is_empty() {
        return;
    }
    out.push('_');
    out.push_str(tag);
    out.push_str(&escape_label(label));
}

/// Percent-escapes everything outside `[A-Za-z0-9.~-]`, so a label never
/// contains the `_` field delimiter.
fn escape_label(label: &str) -> String {
    urlencoding::encode(label).replace('_', "%5F")
}

/// Computes the variant axes for `ctx`.
pub fn key_extension(ctx: &RequestContext, config: &PageCacheConfig) -> KeyExtension {
    let mut extension = KeyExtension {
        useragent: classify(&config.mobile_groups, ctx.user_agent()),
        referrer: classify(&config.referrer_groups, ctx.referrer()),
        encryption: if ctx.is_tls() { "ssl".to_owned() } else { String::new() },
        compression: compression::negotiate(ctx.accept_encoding(), ctx.user_agent(), config),
        preview: ctx.facts().preview,
        group: group_for(ctx, config),
        ..KeyExtension::default()
    };

    if let Some(group) = cookie_group(ctx, config) {
        if !group.cache {
            extension.cache = false;
            extension.reason = format!("cookiegroup {}", group.name);
        }
        extension.cookie = group.name.clone();
    }

    extension
}

fn classify(groups: &[crate::config::ClassifierGroup], value: &str) -> String {
    groups
        .iter()
        .find(|group| group.matches(value))
        .map(|group| group.name.clone())
        .unwrap_or_default()
}

fn cookie_group<'a>(
    ctx: &RequestContext,
    config: &'a PageCacheConfig,
) -> Option<&'a crate::config::CookieGroup> {
    config.cookie_groups.iter().filter(|group| group.enabled).find(|group| {
        ctx.cookies()
            .iter()
            .any(|(name, value)| group.matches(&format!("{name}={value}")))
    })
}

fn group_for(ctx: &RequestContext, config: &PageCacheConfig) -> Group {
    if !config.engine.is_enhanced() {
        let basename = ctx.path().rsplit('/').next().unwrap_or_default();
        if !basename.is_empty() && config.sitemap.is_match(basename) {
            return Group::Sitemaps;
        }
    }
    if config.cache_rest && ctx.is_rest(&config.rest_prefix) {
        return Group::Rest;
    }
    Group::Default
}

/// Derives the storage key for `url` (host plus preprocessed URI).
///
/// Path-keyed engines get a relative `host/path/` for pages in the default
/// group, which enhanced mode extends to a file name with `_index` and a
/// `.html`/`.xml` postfix. Everything else gets a hashed URL part.
pub fn page_key(extension: &KeyExtension, url: &str, config: &PageCacheConfig) -> String {
    let url = url.split('#').next().unwrap_or_default().to_lowercase();

    let path_keys = config.engine.uses_path_keys() && extension.group.is_default();
    let file_name = path_keys && config.engine.is_enhanced();
    let mut key = if path_keys {
        let (mut path, slash) = generic_url_part(&url);
        if file_name {
            path.push_str("_index");
            if slash {
                path.push_str("_slash");
            }
        }
        path
    } else {
        hex::encode(Sha256::digest(url.as_bytes()))
    };

    key.push_str(&extension.suffix());

    if file_name {
        key.push_str(if xml_postfix(extension, &url, config) {
            ".xml"
        } else {
            ".html"
        });
    }

    key.push_str(extension.compression.key_suffix());
    key
}

/// Decodes, strips the query, collapses separators and drops `index.php`
/// and dot segments. Returns the path (with a trailing `/`) and whether the
/// original URL ended in a slash.
fn generic_url_part(url: &str) -> (String, bool) {
    let decoded = urlencoding::decode_binary(url.as_bytes());
    let decoded = String::from_utf8_lossy(&decoded);

    let mut collapsed = String::with_capacity(decoded.len());
    for c in decoded.chars() {
        let c = if c == '\\' { '/' } else { c };
        if c == '/' && collapsed.ends_with('/') {
            continue;
        }
        collapsed.push(c);
    }
    let collapsed = collapsed.replace("/index.php", "/");
    let without_query = collapsed.split('?').next().unwrap_or_default();
    let slash = without_query.ends_with('/');

    let segments: Vec<&str> = without_query
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect();
    (format!("{}/", segments.join("/")), slash)
}

fn xml_postfix(extension: &KeyExtension, url: &str, config: &PageCacheConfig) -> bool {
    if !config.nginx_handle_xml {
        return false;
    }
    let content_type = extension.content_type.to_ascii_lowercase();
    let xml_type = [
        "text/xml",
        "text/xsl",
        "application/xhtml+xml",
        "application/rdf+xml",
        "application/rss+xml",
        "application/atom+xml",
        "application/xml",
    ]
    .iter()
    .any(|candidate| content_type.contains(candidate));
    let path = url.split('?').next().unwrap_or_default();
    xml_type || path.ends_with("/feed") || path.contains("/feed/") || path.contains(".xsl")
}
