//! Serve-time fragments inside cached pages.
//!
//! A page may carry marked regions that must be recomputed on every serve:
//!
//! ```text
//! <!-- mfunc SECRET greeting visitor --><!-- /mfunc SECRET -->
//! <!-- mclude SECRET partials/cart.html --><!-- /mclude SECRET -->
//! ```
//!
//! The `mfunc` form names a function registered in a [`FragmentRegistry`]
//! followed by its argument string (the inner text is used when the
//! opening marker carries nothing). The `mclude` form names a file under
//! the configured include root. Markers are recognised only when they carry
//! the shared secret, so page content cannot forge them. Failures render a
//! visible, escaped diagnostic in place of the fragment.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use regex::bytes::{Captures, Regex, RegexBuilder};

use crate::config::PageCacheConfig;

/// A fragment renderer. Receives the argument string of its marker.
pub type FragmentFn = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

/// Named fragment functions available to `mfunc` markers.
#[derive(Clone, Default)]
pub struct FragmentRegistry {
    functions: HashMap<String, FragmentFn>,
}

impl fmt::Debug for FragmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FragmentRegistry").field("functions", &names).finish()
    }
}

impl FragmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn get(&self, name: &str) -> Option<&FragmentFn> {
        self.functions.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Detects and renders dynamic fragments.
#[derive(Clone, Debug, Default)]
pub struct DynamicProcessor {
    exec: Option<Regex>,
    include: Option<Regex>,
    registry: FragmentRegistry,
    include_root: Option<PathBuf>,
}

fn marker_regex(tag: &str, secret: &str) -> Option<Regex> {
    let secret = regex::escape(secret);
    let source = format!(r"<!--\s*{tag}\s*{secret}(.*?)-->(.*?)<!--\s*/{tag}\s*{secret}\s*-->");
    match RegexBuilder::new(&source)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
    {
        Ok(regex) => Some(regex),
        Err(err) => {
            tracing::warn!(error = %err, "dynamic fragment markers disabled");
            None
        }
    }
}

impl DynamicProcessor {
    /// With no secret the processor is inert: nothing is detected and
    /// rendering returns the body unchanged.
    pub fn new(secret: Option<&str>, registry: FragmentRegistry, include_root: Option<PathBuf>) -> Self {
        let secret = secret.map(str::trim).filter(|secret| !secret.is_empty());
        Self {
            exec: secret.and_then(|secret| marker_regex("mfunc", secret)),
            include: secret.and_then(|secret| marker_regex("mclude", secret)),
            registry,
            include_root,
        }
    }

    pub fn from_config(config: &PageCacheConfig, registry: FragmentRegistry) -> Self {
        Self::new(
            config.dynamic_secret.as_deref(),
            registry,
            config.dynamic_include_root.clone(),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.exec.is_some() || self.include.is_some()
    }

    pub fn has_dynamic(&self, body: &[u8]) -> bool {
        self.exec.as_ref().is_some_and(|regex| regex.is_match(body))
            || self.include.as_ref().is_some_and(|regex| regex.is_match(body))
    }

    /// Replaces every marker with freshly computed output.
    pub async fn render(&self, body: &[u8]) -> Bytes {
        let executed = match &self.exec {
            Some(regex) => regex
                .replace_all(body, |caps: &Captures<'_>| self.execute(caps))
                .into_owned(),
            None => body.to_vec(),
        };

        let Some(regex) = &self.include else {
            return Bytes::from(executed);
        };

        let markers: Vec<(usize, usize, String)> = regex
            .captures_iter(&executed)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some((whole.start(), whole.end(), marker_payload(&caps)))
            })
            .collect();

        let mut output = Vec::with_capacity(executed.len());
        let mut last = 0;
        for (start, end, file) in markers {
            output.extend_from_slice(&executed[last..start]);
            output.extend_from_slice(&self.include(&file).await);
            last = end;
        }
        output.extend_from_slice(&executed[last..]);
        Bytes::from(output)
    }

    fn execute(&self, caps: &Captures<'_>) -> Vec<u8> {
        let code = marker_payload(caps);
        if code.is_empty() {
            return escape_html(
                "Invalid mfunc tag syntax. The correct format is: <!-- mfunc SECRET name arguments --><!-- /mfunc SECRET --> or <!-- mfunc SECRET -->name arguments<!-- /mfunc SECRET -->.",
            )
            .into_bytes();
        }

        let (name, args) = match code.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (code.as_str(), ""),
        };

        match self.registry.get(name) {
            Some(function) => match function(args) {
                Ok(output) => output.into_bytes(),
                Err(err) => {
                    tracing::debug!(fragment = %name, error = %err, "dynamic fragment failed");
                    format!("Unable to execute code: {}", escape_html(&code)).into_bytes()
                }
            },
            None => {
                tracing::debug!(fragment = %name, "unknown dynamic fragment");
                format!("Unable to execute code: {}", escape_html(&code)).into_bytes()
            }
        }
    }

    async fn include(&self, file: &str) -> Vec<u8> {
        if file.is_empty() {
            return escape_html(
                "Incorrect mclude tag syntax. The correct format is: <!-- mclude SECRET path/to/file --><!-- /mclude SECRET --> or <!-- mclude SECRET -->path/to/file<!-- /mclude SECRET -->.",
            )
            .into_bytes();
        }

        let resolved = self
            .include_root
            .as_deref()
            .and_then(|root| resolve_within(root, file));
        let contents = match resolved {
            Some(path) => tokio::fs::read(&path).await.ok(),
            None => None,
        };
        contents.unwrap_or_else(|| format!("Unable to open file: {}", escape_html(file)).into_bytes())
    }
}

/// Opening-marker text, or the inner text when the marker carries nothing.
fn marker_payload(caps: &Captures<'_>) -> String {
    let part = |idx: usize| {
        caps.get(idx)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).trim().to_owned())
            .unwrap_or_default()
    };
    let opening = part(1);
    if opening.is_empty() {
        part(2)
    } else {
        opening
    }
}

/// Joins `relative` onto `root`, refusing absolute paths and `..`.
fn resolve_within(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(root.join(relative))
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            other => out.push(other),
        }
    }
    out
}
