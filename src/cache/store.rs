//! On-disk content-addressed cache store
//!
//! Layout under the cache directory:
//!
//! | Path              | Role                               |
//! |-------------------|------------------------------------|
//! | `blobs/aa/bb/<k>` | payloads, sharded by key prefix    |
//! | `index.journal`   | metadata journal                   |
//! | `meta/version`    | on-disk format version             |
//! | `.lock`           | exclusive build lock               |
//! | `policy.yaml`     | operator policy, re-read per build |
//!
//! All mutations go through `&mut self`, which serialises them; a single
//! process holds the exclusive lock for the whole build and concurrent
//! builds fail with `CacheBusy`. A blob is only visible once its journal
//! record is on disk; on open, blobs without metadata are reaped and
//! metadata without blobs is dropped.

use crate::cache::entry::{canonical_source, fingerprint, natural_cmp, CacheEntry};
use crate::cache::journal::{Journal, Record};
use crate::cache::policy::{EffectivePolicy, Eviction, ItemClass, Policy};
use crate::error::{ImagerError, ImagerResult};
use chrono::Utc;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Newest on-disk format this build understands
pub const FORMAT_VERSION: u32 = 1;

/// Outcome of a cache lookup
#[derive(Debug)]
pub enum Lookup {
    /// Fresh entry; the path is a read-only handle to the payload
    Hit(CacheEntry, PathBuf),
    /// Present but past its revalidation window; the caller must
    /// revalidate upstream and report back
    StaleHit(CacheEntry, PathBuf),
    Miss,
    /// Policy disables caching for this source or class
    Ignored,
}

/// Outcome of an admission attempt
#[derive(Debug)]
pub enum Admission {
    Admitted(CacheEntry),
    Rejected(RejectReason),
}

/// Why an artifact was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Policy disables caching at some enclosing scope
    Disabled,
    /// Eviction could not free enough room
    NoRoom,
}

/// An eviction that took place, for user feedback
#[derive(Debug, Clone)]
pub struct EvictionNotice {
    pub source: String,
    pub reason: String,
}

/// The cache store, holding the directory lock for its lifetime
pub struct CacheStore {
    root: PathBuf,
    policy: Policy,
    journal: Journal,
    entries: BTreeMap<String, CacheEntry>,
    _lock: File,
}

impl CacheStore {
    /// Open the cache, acquiring the exclusive lock and reconciling the
    /// journal with the blob tree
    pub fn open(root: &Path) -> ImagerResult<Self> {
        fs::create_dir_all(root.join("blobs"))
            .and_then(|_| fs::create_dir_all(root.join("meta")))
            .map_err(|e| ImagerError::io(format!("creating cache at {}", root.display()), e))?;

        let version_path = root.join("meta").join("version");
        if version_path.exists() {
            let text = fs::read_to_string(&version_path)
                .map_err(|e| ImagerError::io("reading cache version", e))?;
            let found: u32 = text
                .trim()
                .parse()
                .map_err(|_| ImagerError::JournalCorrupt(format!("bad version `{}`", text.trim())))?;
            if found > FORMAT_VERSION {
                return Err(ImagerError::CacheVersionMismatch {
                    found,
                    supported: FORMAT_VERSION,
                });
            }
        } else {
            fs::write(&version_path, format!("{FORMAT_VERSION}\n"))
                .map_err(|e| ImagerError::io("writing cache version", e))?;
        }

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(root.join(".lock"))
            .map_err(|e| ImagerError::io("opening cache lock", e))?;
        lock.try_lock_exclusive()
            .map_err(|_| ImagerError::CacheBusy(root.to_path_buf()))?;

        let policy = Policy::load(root)?;
        let (mut journal, mut entries) = Journal::open(&root.join("index.journal"))?;

        // metadata without blobs is dropped
        let orphans: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !root.join(&entry.blob_path).is_file())
            .map(|(key, _)| key.clone())
            .collect();
        for key in orphans {
            warn!(%key, "dropping cache record without blob");
            journal.append(&Record::Remove { key: key.clone() })?;
            entries.remove(&key);
        }

        // blobs without metadata are reaped
        let mut known: std::collections::HashSet<&Path> = std::collections::HashSet::new();
        for entry in entries.values() {
            known.insert(entry.blob_path.as_path());
        }
        reap_unknown_blobs(root, &root.join("blobs"), &known);

        Ok(Self {
            root: root.to_path_buf(),
            policy,
            journal,
            entries,
            _lock: lock,
        })
    }

    /// Whether the policy caches anything at all
    pub fn is_enabled(&self) -> bool {
        self.policy.enabled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes currently cached
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Absolute payload path for an entry
    pub fn blob_path(&self, entry: &CacheEntry) -> PathBuf {
        self.root.join(&entry.blob_path)
    }

    fn abs_blob_path(&self, entry: &CacheEntry) -> PathBuf {
        self.blob_path(entry)
    }

    /// Look a source up. A `Hit` bumps `last_used_on`; a `StaleHit` must
    /// be revalidated upstream before use.
    pub fn lookup(&mut self, class: ItemClass, source: &str) -> ImagerResult<Lookup> {
        let canonical = canonical_source(class, source);
        let effective = self.policy.resolve(class, &canonical);
        if !effective.enabled {
            return Ok(Lookup::Ignored);
        }

        let key = fingerprint(&canonical);
        let now = Utc::now();

        enum Fate {
            Expired(CacheEntry),
            Stale(CacheEntry),
            Fresh,
        }
        let fate = match self.entries.get(&key) {
            None => return Ok(Lookup::Miss),
            Some(entry) => {
                if effective
                    .max_age
                    .is_some_and(|max_age| entry.is_expired(max_age, now))
                {
                    Fate::Expired(entry.clone())
                } else if effective
                    .check_after
                    .is_some_and(|window| entry.needs_check(window, now))
                {
                    Fate::Stale(entry.clone())
                } else {
                    Fate::Fresh
                }
            }
        };

        match fate {
            Fate::Expired(entry) => {
                self.evict(&entry, "past max_age")?;
                Ok(Lookup::Miss)
            }
            Fate::Stale(entry) => {
                let path = self.abs_blob_path(&entry);
                Ok(Lookup::StaleHit(entry, path))
            }
            Fate::Fresh => {
                let record = match self.entries.get_mut(&key) {
                    None => return Ok(Lookup::Miss),
                    Some(entry) => {
                        entry.last_used_on = now;
                        entry.nb_used += 1;
                        Record::Touch {
                            key: key.clone(),
                            last_used_on: entry.last_used_on,
                            nb_used: entry.nb_used,
                        }
                    }
                };
                self.journal.append(&record)?;
                let entry = match self.entries.get(&key) {
                    None => return Ok(Lookup::Miss),
                    Some(entry) => entry.clone(),
                };
                let path = self.abs_blob_path(&entry);
                Ok(Lookup::Hit(entry, path))
            }
        }
    }

    /// Record a successful upstream revalidation (e.g. a 304), making a
    /// stale entry fresh again
    pub fn mark_checked(&mut self, key: &str) -> ImagerResult<()> {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.checked_on = Utc::now();
            let record = Record::Check {
                key: key.to_string(),
                checked_on: entry.checked_on,
            };
            self.journal.append(&record)?;
        }
        Ok(())
    }

    /// Admit a fully-downloaded artifact sitting at `tmp_blob`. On
    /// success the blob is moved into the store; on rejection it is left
    /// where it is and stays usable for the current build.
    pub fn admit(
        &mut self,
        class: ItemClass,
        source: &str,
        tmp_blob: &Path,
        mut entry_meta: CacheEntry,
    ) -> ImagerResult<Admission> {
        let canonical = canonical_source(class, source);
        let effective = self.policy.resolve(class, &canonical);
        if !effective.enabled {
            return Ok(Admission::Rejected(RejectReason::Disabled));
        }

        let size = entry_meta.size_bytes;
        if let Some(max_size) = effective.max_size {
            // a blob that can never fit is rejected before any eviction
            if size > max_size {
                return Ok(Admission::Rejected(RejectReason::NoRoom));
            }
        }

        // same key is never co-resident
        if let Some(previous) = self.entries.get(&entry_meta.key).cloned() {
            self.evict(&previous, "replaced by new download")?;
        }

        if !self.evict_to_fit(size, class, &effective)? {
            return Ok(Admission::Rejected(RejectReason::NoRoom));
        }
        self.retain_versions(class, &entry_meta, &effective)?;

        let dest = self.abs_blob_path(&entry_meta);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ImagerError::io("creating blob directory", e))?;
        }
        move_or_copy(tmp_blob, &dest)?;
        let blob = File::open(&dest).map_err(|e| ImagerError::io("opening admitted blob", e))?;
        blob.sync_all()
            .map_err(|e| ImagerError::io("syncing admitted blob", e))?;

        entry_meta.added_on = Utc::now();
        entry_meta.last_used_on = entry_meta.added_on;
        entry_meta.checked_on = entry_meta.added_on;
        entry_meta.nb_used = 1;

        self.journal.append(&Record::Add {
            entry: entry_meta.clone(),
        })?;
        self.entries
            .insert(entry_meta.key.clone(), entry_meta.clone());
        Ok(Admission::Admitted(entry_meta))
    }

    /// Force-remove one entry
    pub fn invalidate(&mut self, key: &str) -> ImagerResult<()> {
        if let Some(entry) = self.entries.get(key).cloned() {
            self.evict(&entry, "invalidated")?;
        }
        Ok(())
    }

    /// Apply age/count/size limits without admission pressure. Returns
    /// what was evicted, for user feedback.
    pub fn purge(&mut self) -> ImagerResult<Vec<EvictionNotice>> {
        let mut notices = Vec::new();
        if !self.policy.enabled {
            return Ok(notices);
        }

        for (entry, reason) in self.purge_plan() {
            self.evict(&entry, &reason)?;
            notices.push(EvictionNotice {
                source: entry.source.clone(),
                reason,
            });
        }
        Ok(notices)
    }

    /// What `purge` would evict, without touching anything
    pub fn purge_plan(&self) -> Vec<(CacheEntry, String)> {
        let now = Utc::now();
        let mut doomed: Vec<(CacheEntry, String)> = Vec::new();
        let mut doomed_keys = std::collections::HashSet::new();
        let mut doom = |entry: &CacheEntry, reason: String, keys: &mut std::collections::HashSet<String>| {
            if keys.insert(entry.key.clone()) {
                doomed.push((entry.clone(), reason));
            }
        };

        // per-entry rules: no-longer-cacheable sources and expiry
        for entry in self.entries.values() {
            let effective = self.policy.resolve(entry.class, &entry.source);
            if !effective.enabled {
                doom(entry, "no longer cacheable under policy".to_string(), &mut doomed_keys);
                continue;
            }
            if let Some(max_age) = effective.max_age {
                if entry.is_expired(max_age, now) {
                    doom(entry, "past max_age".to_string(), &mut doomed_keys);
                }
            }
        }

        // per-scope count and size caps
        for class in [ItemClass::OciImage, ItemClass::File] {
            let pool: Vec<&CacheEntry> = self
                .entries
                .values()
                .filter(|e| e.class == class && !doomed_keys.contains(&e.key))
                .collect();
            if pool.is_empty() {
                continue;
            }
            // entries of one class share one effective scope unless a
            // filter splits them; group by matched filter index
            let mut buckets: BTreeMap<Option<usize>, Vec<&CacheEntry>> = BTreeMap::new();
            for entry in pool {
                let effective = self.policy.resolve(class, &entry.source);
                buckets.entry(effective.matched_filter).or_default().push(entry);
            }
            for bucket in buckets.values() {
                let effective = self.policy.resolve(class, &bucket[0].source);
                let mut live: Vec<&CacheEntry> = bucket.clone();

                if let Some(max_num) = effective.max_num {
                    let mut by_age = live.clone();
                    by_age.sort_by_key(|e| e.added_on);
                    while by_age.len() > max_num as usize {
                        let victim = by_age.remove(0);
                        doom(victim, format!("over max_num ({max_num})"), &mut doomed_keys);
                        live.retain(|e| e.key != victim.key);
                    }
                }

                if let Some(max_size) = effective.max_size {
                    let mut ordered = live.clone();
                    sort_for_eviction(effective.eviction, &mut ordered);
                    let mut total: u64 = live.iter().map(|e| e.size_bytes).sum();
                    let mut idx = 0;
                    while total > max_size && idx < ordered.len() {
                        let victim = ordered[idx];
                        idx += 1;
                        if doomed_keys.contains(&victim.key) {
                            continue;
                        }
                        doom(victim, "over max_size".to_string(), &mut doomed_keys);
                        total -= victim.size_bytes;
                    }
                }
            }
        }

        // global size cap
        if let Some(max_size) = self.policy.options.max_size.filter(|&m| m > 0) {
            let mut live: Vec<&CacheEntry> = self
                .entries
                .values()
                .filter(|e| !doomed_keys.contains(&e.key))
                .collect();
            let eviction = self.policy.options.eviction.unwrap_or_default();
            sort_for_eviction(eviction, &mut live);
            let mut total: u64 = live.iter().map(|e| e.size_bytes).sum();
            for victim in live {
                if total <= max_size {
                    break;
                }
                doom(victim, "over global max_size".to_string(), &mut doomed_keys);
                total -= victim.size_bytes;
            }
        }

        doomed
    }

    /// Free room for an incoming blob of `size` bytes within the scope
    /// the effective policy describes. Hard caps (age, count) first,
    /// then the eviction strategy until it fits. False means the pool
    /// ran dry.
    fn evict_to_fit(
        &mut self,
        size: u64,
        class: ItemClass,
        effective: &EffectivePolicy,
    ) -> ImagerResult<bool> {
        let now = Utc::now();
        let scope = |store: &Self| -> Vec<CacheEntry> {
            store
                .entries
                .values()
                .filter(|e| {
                    e.class == class
                        && store.policy.resolve(class, &e.source).matched_filter
                            == effective.matched_filter
                })
                .cloned()
                .collect()
        };

        if let Some(max_age) = effective.max_age {
            for entry in scope(self) {
                if entry.is_expired(max_age, now) {
                    self.evict(&entry, "past max_age")?;
                }
            }
        }

        if let Some(max_num) = effective.max_num {
            let mut pool = scope(self);
            pool.sort_by_key(|e| e.added_on);
            while pool.len() + 1 > max_num as usize {
                let victim = pool.remove(0);
                self.evict(&victim, "over max_num")?;
            }
        }

        let Some(max_size) = effective.max_size else {
            return Ok(true);
        };
        loop {
            let pool = scope(self);
            let used: u64 = pool.iter().map(|e| e.size_bytes).sum();
            if used + size <= max_size {
                return Ok(true);
            }
            let mut ordered: Vec<&CacheEntry> = pool.iter().collect();
            sort_for_eviction(effective.eviction, &mut ordered);
            let Some(victim) = ordered.first().map(|e| (*e).clone()) else {
                return Ok(false);
            };
            self.evict(&victim, "making room")?;
        }
    }

    /// Retain only the newest versions of an identified item, scoped to
    /// the same identifier and source host. Runs regardless of the
    /// scope's other caps.
    fn retain_versions(
        &mut self,
        class: ItemClass,
        incoming: &CacheEntry,
        effective: &EffectivePolicy,
    ) -> ImagerResult<()> {
        let (Some(keep), Some(identifier), Some(version)) = (
            effective.keep_identified_versions,
            incoming.identifier.as_deref(),
            incoming.version.as_deref(),
        ) else {
            return Ok(());
        };

        let host = incoming.source_host().map(str::to_string);
        let mut lower: Vec<CacheEntry> = self
            .entries
            .values()
            .filter(|e| {
                e.class == class
                    && e.identifier.as_deref() == Some(identifier)
                    && e.source_host().map(str::to_string) == host
                    && e.version
                        .as_deref()
                        .map(|v| natural_cmp(v, version) == std::cmp::Ordering::Less)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();

        // newest lower versions first; the incoming entry takes one slot
        lower.sort_by(|a, b| {
            natural_cmp(
                b.version.as_deref().unwrap_or(""),
                a.version.as_deref().unwrap_or(""),
            )
        });
        for obsolete in lower.into_iter().skip(keep.saturating_sub(1) as usize) {
            self.evict(&obsolete, "version now obsolete")?;
        }
        Ok(())
    }

    fn evict(&mut self, entry: &CacheEntry, reason: &str) -> ImagerResult<()> {
        debug!(source = %entry.source, reason, "evicting cache entry");
        let path = self.abs_blob_path(entry);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ImagerError::io(format!("removing {}", path.display()), e)),
        }
        self.journal.append(&Record::Remove {
            key: entry.key.clone(),
        })?;
        self.entries.remove(&entry.key);
        Ok(())
    }
}

/// Order candidates so the first element is the next victim
fn sort_for_eviction(eviction: Eviction, pool: &mut [&CacheEntry]) {
    match eviction {
        Eviction::Oldest => pool.sort_by_key(|e| e.added_on),
        Eviction::Newest => pool.sort_by_key(|e| std::cmp::Reverse(e.added_on)),
        Eviction::Largest => pool.sort_by_key(|e| std::cmp::Reverse(e.size_bytes)),
        Eviction::Smallest => pool.sort_by_key(|e| e.size_bytes),
        Eviction::Lru => pool.sort_by_key(|e| e.last_used_on),
    }
}

/// Remove blob files the journal does not know about
fn reap_unknown_blobs(root: &Path, dir: &Path, known: &std::collections::HashSet<&Path>) {
    let Ok(listing) = fs::read_dir(dir) else {
        return;
    };
    for item in listing.flatten() {
        let path = item.path();
        if path.is_dir() {
            reap_unknown_blobs(root, &path, known);
        } else if let Ok(relative) = path.strip_prefix(root) {
            if !known.contains(relative) {
                warn!(blob = %relative.display(), "reaping blob without metadata");
                let _ = fs::remove_file(&path);
            }
        }
    }
}

/// Rename, falling back to copy+unlink across filesystems
fn move_or_copy(src: &Path, dest: &Path) -> ImagerResult<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dest)
                .map_err(|e| ImagerError::io(format!("copying blob to {}", dest.display()), e))?;
            let _ = fs::remove_file(src);
            Ok(())
        }
    }
}
