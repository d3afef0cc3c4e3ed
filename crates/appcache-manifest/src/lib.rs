//! # AppCache Manifest
//!
//! Manifest parsing and versioning for the AppCache compatibility shim.
//!
//! ## Features
//!
//! - **Parsing**: `CACHE:` / `NETWORK:` / `FALLBACK:` / `SETTINGS:` sections
//! - **Normalization**: every entry resolved to an absolute URL against the manifest URL
//! - **Versioning**: content-addressed `ManifestVersion` history per manifest URL
//!
//! ## Architecture
//!
//! ```text
//! ManifestHistory (one per manifest URL, oldest first)
//!     └── ManifestVersion
//!             ├── hash  (SHA-256 of the raw text; names the per-version cache)
//!             ├── text  (raw manifest body)
//!             └── ParsedManifest
//!                     ├── cache:    [Url]
//!                     ├── network:  [Url | *]
//!                     └── fallback: prefix → Url
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

// ==================== Errors ====================

/// Errors that can occur when handling manifest locations.
#[derive(Error, Debug, Clone)]
pub enum ManifestError {
    #[error("Invalid manifest URL {attr:?} relative to {base}: {reason}")]
    InvalidUrl {
        attr: String,
        base: Url,
        reason: String,
    },
}

// ==================== Types ====================

/// A single entry in the `NETWORK:` section.
///
/// The literal `*` token is only legal here; in any other section it is
/// dropped by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkEntry {
    /// The `*` wildcard: every URL may go to the network.
    Wildcard,
    /// An explicit URL that may go to the network.
    Url(Url),
}

/// A single `FALLBACK:` rule: requests whose URL starts with `prefix` may be
/// served the response stored for `target` when the network fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackEntry {
    /// Absolute URL prefix, matched as a raw string against request URLs.
    pub prefix: String,
    /// Absolute URL of the fallback resource.
    pub target: Url,
}

/// The three sections of a parsed manifest, all URLs absolute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedManifest {
    /// URLs to pre-cache, in manifest order.
    pub cache: Vec<Url>,
    /// Network whitelist, in manifest order.
    pub network: Vec<NetworkEntry>,
    /// Fallback rules, in manifest order, first occurrence of a prefix wins.
    pub fallback: Vec<FallbackEntry>,
}

impl ParsedManifest {
    /// Whether `url` is listed in the CACHE section.
    pub fn is_cached(&self, url: &Url) -> bool {
        self.cache.iter().any(|u| u == url)
    }

    /// Whether `url` may go to the network: an exact NETWORK entry or the
    /// `*` wildcard.
    pub fn allows_network(&self, url: &Url) -> bool {
        self.network.iter().any(|entry| match entry {
            NetworkEntry::Wildcard => true,
            NetworkEntry::Url(u) => u == url,
        })
    }

    /// The fallback rule with the longest prefix of `url`, if any.
    pub fn fallback_match(&self, url: &str) -> Option<&FallbackEntry> {
        let prefix = longest_prefix(self.fallback.iter().map(|f| f.prefix.as_str()), url)?;
        self.fallback.iter().rfind(|f| f.prefix == prefix)
    }

    /// URLs the installer must pre-cache: the CACHE section plus every
    /// fallback target.
    pub fn precache_urls(&self) -> Vec<Url> {
        let mut urls = self.cache.clone();
        for entry in &self.fallback {
            if !urls.contains(&entry.target) {
                urls.push(entry.target.clone());
            }
        }
        urls
    }
}

/// One installed version of a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestVersion {
    /// Lowercase hex SHA-256 of `text`. Doubles as the name of the
    /// per-version response cache.
    pub hash: String,
    /// The raw manifest body this version was built from.
    pub text: String,
    /// The parsed sections.
    pub parsed: ParsedManifest,
}

impl ManifestVersion {
    /// Parse `text` against `manifest_url` and digest it into a version.
    pub fn from_text(manifest_url: &Url, text: &str) -> Self {
        Self {
            hash: manifest_digest(text),
            text: text.to_string(),
            parsed: parse_manifest(manifest_url, text),
        }
    }
}

/// Ordered version history for one manifest URL, oldest first.
///
/// The last entry is the current version. No two adjacent entries share a
/// hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestHistory {
    versions: Vec<ManifestVersion>,
}

impl ManifestHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current (most recently installed) version.
    pub fn current(&self) -> Option<&ManifestVersion> {
        self.versions.last()
    }

    /// Append a version. Returns `false` without modifying the history when
    /// `version` carries the same hash as the current entry.
    pub fn push(&mut self, version: ManifestVersion) -> bool {
        if self.current().is_some_and(|cur| cur.hash == version.hash) {
            return false;
        }
        self.versions.push(version);
        true
    }

    /// Look up a version by hash.
    pub fn find(&self, hash: &str) -> Option<&ManifestVersion> {
        self.versions.iter().find(|v| v.hash == hash)
    }

    /// Hashes of every retired version (all but the current one).
    pub fn stale_hashes(&self) -> impl Iterator<Item = &str> {
        let stale = self.versions.len().saturating_sub(1);
        self.versions[..stale].iter().map(|v| v.hash.as_str())
    }

    /// Remove retired versions whose hash satisfies `doomed`. The current
    /// version is never removed. Returns how many versions were dropped.
    pub fn prune<F: Fn(&str) -> bool>(&mut self, doomed: F) -> usize {
        let before = self.versions.len();
        let current = self.current().map(|v| v.hash.clone());
        self.versions
            .retain(|v| Some(&v.hash) == current.as_ref() || !doomed(&v.hash));
        before - self.versions.len()
    }

    /// Number of versions, oldest first.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether no version has been installed yet.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Iterate versions, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ManifestVersion> {
        self.versions.iter()
    }
}

// ==================== Digest ====================

/// Stable content digest of a raw manifest body: lowercase hex SHA-256.
///
/// Every component keys per-version caches and client bindings off this
/// value, so it must stay deterministic across agents.
pub fn manifest_digest(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

// ==================== Parsing ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Cache,
    Network,
    Fallback,
    Settings,
}

/// Resolve a (possibly relative) manifest attribute against the document URL.
pub fn resolve_manifest_url(document_url: &Url, attr: &str) -> Result<Url, ManifestError> {
    document_url
        .join(attr)
        .map_err(|e| ManifestError::InvalidUrl {
            attr: attr.to_string(),
            base: document_url.clone(),
            reason: e.to_string(),
        })
}

/// Parse a manifest body into its three sections.
///
/// The parser is lenient the way browsers were: an optional `CACHE MANIFEST`
/// magic first line, `#` comments, blank lines, entries before any section
/// header belong to CACHE, unknown lines inside `SETTINGS:` are skipped, and
/// individual entries that fail URL resolution (or use `*` outside
/// `NETWORK:`) are dropped without failing the parse.
pub fn parse_manifest(manifest_url: &Url, text: &str) -> ParsedManifest {
    let mut parsed = ParsedManifest::default();
    let mut section = Section::Cache;

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if index == 0 && line == "CACHE MANIFEST" {
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line {
            "CACHE:" => {
                section = Section::Cache;
                continue;
            }
            "NETWORK:" => {
                section = Section::Network;
                continue;
            }
            "FALLBACK:" => {
                section = Section::Fallback;
                continue;
            }
            "SETTINGS:" => {
                section = Section::Settings;
                continue;
            }
            _ => {}
        }

        match section {
            Section::Cache => {
                if line == "*" {
                    continue;
                }
                if let Ok(url) = manifest_url.join(line) {
                    parsed.cache.push(url);
                }
            }
            Section::Network => {
                if line == "*" {
                    parsed.network.push(NetworkEntry::Wildcard);
                } else if let Ok(url) = manifest_url.join(line) {
                    parsed.network.push(NetworkEntry::Url(url));
                }
            }
            Section::Fallback => {
                let mut parts = line.split_whitespace();
                let (Some(prefix_token), Some(target_token)) = (parts.next(), parts.next())
                else {
                    continue;
                };
                if prefix_token == "*" || target_token == "*" {
                    continue;
                }
                let (Ok(prefix), Ok(target)) = (
                    manifest_url.join(prefix_token),
                    manifest_url.join(target_token),
                ) else {
                    continue;
                };
                let prefix = prefix.to_string();
                if !parsed.fallback.iter().any(|f| f.prefix == prefix) {
                    parsed.fallback.push(FallbackEntry { prefix, target });
                }
            }
            Section::Settings => {}
        }
    }

    parsed
}

// ==================== Prefix matching ====================

/// The longest element of `keys` that is a raw-string prefix of `url`.
///
/// Ties go to the last candidate encountered, stable with respect to input
/// order.
pub fn longest_prefix<'a, I>(keys: I, url: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<&'a str> = None;
    for key in keys {
        if !url.starts_with(key) {
            continue;
        }
        if best.is_none_or(|b| key.len() >= b.len()) {
            best = Some(key);
        }
    }
    best
}

// ==================== Tests ====================
