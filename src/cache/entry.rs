//! Cache entry records and source canonicalisation
//!
//! The cache key is the SHA-256 fingerprint of a canonical source: for
//! files the canonicalised URL (lowercase scheme and host, path and
//! query kept, fragment dropped), for OCI images the full reference
//! including tag or digest. Two entries never share a key.

use crate::cache::policy::ItemClass;
use crate::recipe::Checksum;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::path::PathBuf;

/// One cached artifact, as persisted in the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// SHA-256 hex fingerprint of the canonical source
    pub key: String,

    pub class: ItemClass,

    /// Canonical source URL or OCI reference
    pub source: String,

    /// Logical name for version retention (file basename minus version
    /// token, OCI repository without tag)
    pub identifier: Option<String>,

    /// Version token parsed out of the identifier
    pub version: Option<String>,

    pub size_bytes: u64,

    #[serde(default)]
    pub checksum: Option<Checksum>,

    /// HTTP validators captured at admission, for conditional revalidation
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,

    pub added_on: DateTime<Utc>,
    pub last_used_on: DateTime<Utc>,
    pub checked_on: DateTime<Utc>,

    #[serde(default)]
    pub nb_used: u64,

    /// Payload path relative to the cache directory
    pub blob_path: PathBuf,
}

impl CacheEntry {
    /// Build a fresh entry for an artifact about to be admitted
    pub fn new(class: ItemClass, source: &str, size_bytes: u64) -> Self {
        let canonical = canonical_source(class, source);
        let key = fingerprint(&canonical);
        let blob_path = blob_rel_path(&key);
        let (identifier, version) = identify(class, &canonical)
            .map(|(i, v)| (Some(i), Some(v)))
            .unwrap_or((None, None));
        let now = Utc::now();
        Self {
            key,
            class,
            source: canonical,
            identifier,
            version,
            size_bytes,
            checksum: None,
            etag: None,
            last_modified: None,
            added_on: now,
            last_used_on: now,
            checked_on: now,
            nb_used: 0,
            blob_path,
        }
    }

    /// Whether the entry is past the policy's max_age
    pub fn is_expired(&self, max_age_seconds: u64, now: DateTime<Utc>) -> bool {
        self.added_on + Duration::seconds(max_age_seconds as i64) < now
    }

    /// Whether the entry needs upstream revalidation before being served
    pub fn needs_check(&self, check_after_seconds: u64, now: DateTime<Utc>) -> bool {
        self.checked_on + Duration::seconds(check_after_seconds as i64) < now
    }

    /// Host part of the source, scoping version retention
    pub fn source_host(&self) -> Option<&str> {
        source_host(&self.source)
    }
}

/// Canonical form of a source for the given class
pub fn canonical_source(class: ItemClass, source: &str) -> String {
    match class {
        ItemClass::OciImage => source.to_string(),
        ItemClass::File => canonical_url(source),
    }
}

/// Canonicalise a URL: lowercase scheme and host, keep path and query,
/// drop the fragment
pub fn canonical_url(url: &str) -> String {
    let url = url.split('#').next().unwrap_or(url);
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let (host, tail) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    format!(
        "{}://{}{}",
        scheme.to_ascii_lowercase(),
        host.to_ascii_lowercase(),
        tail
    )
}

/// SHA-256 hex fingerprint of a canonical source
pub fn fingerprint(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Blob location for a fingerprint, sharded by its first bytes
pub fn blob_rel_path(fingerprint: &str) -> PathBuf {
    PathBuf::from("blobs")
        .join(&fingerprint[..2])
        .join(&fingerprint[2..4])
        .join(fingerprint)
}

/// Extract (identifier, version) from a canonical source, when the name
/// carries a recognisable version token
pub fn identify(class: ItemClass, source: &str) -> Option<(String, String)> {
    match class {
        ItemClass::OciImage => {
            let re = Regex::new(r"^(?P<ident>.+):(?P<version>.+)$").ok()?;
            let caps = re.captures(source)?;
            Some((caps["ident"].to_string(), caps["version"].to_string()))
        }
        ItemClass::File => {
            let basename = source
                .split('?')
                .next()
                .unwrap_or(source)
                .rsplit('/')
                .next()
                .unwrap_or(source);
            let re = Regex::new(r"^(?P<ident>.+)_(?P<version>\d{4}-\d{2})\.zim$").ok()?;
            let caps = re.captures(basename)?;
            Some((caps["ident"].to_string(), caps["version"].to_string()))
        }
    }
}

/// Host part of a URL or OCI reference
pub fn source_host(source: &str) -> Option<&str> {
    if let Some((_, rest)) = source.split_once("://") {
        return Some(rest.split('/').next().unwrap_or(rest));
    }
    // OCI references lead with their registry
    source.split('/').next()
}

/// Natural-order comparison: digit runs compare numerically, everything
/// else byte-wise ("2024-2" < "2024-10")
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(lc), Some(rc)) => {
                if lc.is_ascii_digit() && rc.is_ascii_digit() {
                    let mut lnum = String::new();
                    while let Some(c) = left.peek().copied().filter(char::is_ascii_digit) {
                        lnum.push(c);
                        left.next();
                    }
                    let mut rnum = String::new();
                    while let Some(c) = right.peek().copied().filter(char::is_ascii_digit) {
                        rnum.push(c);
                        right.next();
                    }
                    let cmp = lnum
                        .trim_start_matches('0')
                        .len()
                        .cmp(&rnum.trim_start_matches('0').len())
                        .then_with(|| lnum.trim_start_matches('0').cmp(rnum.trim_start_matches('0')));
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                } else {
                    let cmp = lc.cmp(&rc);
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                    left.next();
                    right.next();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_url_lowercases_scheme_and_host() {
        assert_eq!(
            canonical_url("HTTPS://Download.Kiwix.ORG/zim/A.zim?x=1#frag"),
            "https://download.kiwix.org/zim/A.zim?x=1"
        );
    }

    #[test]
    fn canonical_url_keeps_path_case() {
        assert_eq!(
            canonical_url("https://host/Path/File.ZIM"),
            "https://host/Path/File.ZIM"
        );
    }

    #[test]
    fn same_source_same_key() {
        let a = CacheEntry::new(ItemClass::File, "https://HOST/x.zim", 1);
        let b = CacheEntry::new(ItemClass::File, "https://host/x.zim", 2);
        assert_eq!(a.key, b.key);
        assert_eq!(a.blob_path, b.blob_path);
    }

    #[test]
    fn blob_path_is_sharded() {
        let path = blob_rel_path("abcdef0123");
        assert_eq!(path, PathBuf::from("blobs/ab/cd/abcdef0123"));
    }

    #[test]
    fn identify_versioned_file() {
        let (ident, version) = identify(
            ItemClass::File,
            "https://download.kiwix.org/zim/kiwix_wp_en_2024-01.zim",
        )
        .unwrap();
        assert_eq!(ident, "kiwix_wp_en");
        assert_eq!(version, "2024-01");
    }

    #[test]
    fn identify_ignores_query() {
        let (ident, _) = identify(
            ItemClass::File,
            "https://host/kiwix_wp_en_2024-01.zim?mirror=1",
        )
        .unwrap();
        assert_eq!(ident, "kiwix_wp_en");
    }

    #[test]
    fn identify_unversioned_file_is_none() {
        assert!(identify(ItemClass::File, "https://host/plain.tar.gz").is_none());
    }

    #[test]
    fn identify_oci_reference() {
        let (ident, version) =
            identify(ItemClass::OciImage, "ghcr.io/offspot/kiwix-serve:3.5.0").unwrap();
        assert_eq!(ident, "ghcr.io/offspot/kiwix-serve");
        assert_eq!(version, "3.5.0");
    }

    #[test]
    fn source_host_extracts() {
        assert_eq!(source_host("https://a.b.c/d/e"), Some("a.b.c"));
        assert_eq!(source_host("ghcr.io/offspot/kiwix:1"), Some("ghcr.io"));
    }

    #[test]
    fn natural_cmp_orders_numerically() {
        assert_eq!(natural_cmp("2024-2", "2024-10"), Ordering::Less);
        assert_eq!(natural_cmp("2024-01", "2024-02"), Ordering::Less);
        assert_eq!(natural_cmp("3.5.0", "3.10.0"), Ordering::Less);
        assert_eq!(natural_cmp("a10", "a9"), Ordering::Greater);
        assert_eq!(natural_cmp("x", "x"), Ordering::Equal);
    }

    #[test]
    fn natural_cmp_leading_zeros() {
        assert_eq!(natural_cmp("007", "7"), Ordering::Equal);
        assert_eq!(natural_cmp("08", "9"), Ordering::Less);
    }

    #[test]
    fn expiry_and_check_windows() {
        let mut entry = CacheEntry::new(ItemClass::File, "https://h/x", 1);
        let now = Utc::now();
        entry.added_on = now - Duration::days(10);
        entry.checked_on = now - Duration::days(10);
        assert!(entry.is_expired(5 * 86400, now));
        assert!(!entry.is_expired(30 * 86400, now));
        assert!(entry.needs_check(86400, now));
        entry.checked_on = now;
        assert!(!entry.needs_check(86400, now));
    }
}
