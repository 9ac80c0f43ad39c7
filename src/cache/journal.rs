//! Append-only metadata journal for the cache index
//!
//! One JSON record per line. Blobs become visible only once their `add`
//! record reaches disk, so `append` fsyncs before returning. Compaction
//! rewrites the journal to one `add` per live entry and swaps it in with
//! an atomic rename. A torn final line (crash mid-append) is dropped on
//! replay; corruption anywhere else fails the open.

use crate::cache::entry::CacheEntry;
use crate::error::{ImagerError, ImagerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One journal record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Record {
    Add {
        entry: CacheEntry,
    },
    Touch {
        key: String,
        last_used_on: DateTime<Utc>,
        nb_used: u64,
    },
    Check {
        key: String,
        checked_on: DateTime<Utc>,
    },
    Remove {
        key: String,
    },
}

/// The on-disk journal and its append handle
pub struct Journal {
    path: PathBuf,
    writer: File,
    live: usize,
    dead: usize,
}

impl Journal {
    /// Open (or create) the journal and replay it into an entry map
    pub fn open(path: &Path) -> ImagerResult<(Self, BTreeMap<String, CacheEntry>)> {
        let mut entries = BTreeMap::new();
        let mut live = 0usize;
        let mut dead = 0usize;

        if path.exists() {
            let reader = BufReader::new(
                File::open(path).map_err(|e| ImagerError::io(format!("opening {}", path.display()), e))?,
            );
            let lines: Vec<String> = reader
                .lines()
                .collect::<Result<_, _>>()
                .map_err(|e| ImagerError::io(format!("reading {}", path.display()), e))?;

            let count = lines.len();
            for (idx, line) in lines.into_iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let record: Record = match serde_json::from_str(&line) {
                    Ok(record) => record,
                    // a torn last line is a crash artifact, not corruption
                    Err(_) if idx + 1 == count => {
                        debug!("dropping torn final journal line");
                        break;
                    }
                    Err(e) => {
                        return Err(ImagerError::JournalCorrupt(format!(
                            "line {}: {e}",
                            idx + 1
                        )))
                    }
                };
                match record {
                    Record::Add { entry } => {
                        if entries.insert(entry.key.clone(), entry).is_some() {
                            dead += 1;
                        }
                        live += 1;
                    }
                    Record::Touch {
                        key,
                        last_used_on,
                        nb_used,
                    } => {
                        if let Some(entry) = entries.get_mut(&key) {
                            entry.last_used_on = last_used_on;
                            entry.nb_used = nb_used;
                        }
                        dead += 1;
                    }
                    Record::Check { key, checked_on } => {
                        if let Some(entry) = entries.get_mut(&key) {
                            entry.checked_on = checked_on;
                        }
                        dead += 1;
                    }
                    Record::Remove { key } => {
                        if entries.remove(&key).is_some() {
                            live -= 1;
                        }
                        dead += 1;
                    }
                }
            }
        }

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ImagerError::io(format!("opening {} for append", path.display()), e))?;

        let mut journal = Self {
            path: path.to_path_buf(),
            writer,
            live,
            dead,
        };

        // amortised: rewrite once superseded records dominate
        if journal.dead > journal.live.max(16) {
            journal.compact(&entries)?;
        }

        Ok((journal, entries))
    }

    /// Append one record; durable once this returns
    pub fn append(&mut self, record: &Record) -> ImagerResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.sync_data())
            .map_err(|e| ImagerError::io(format!("appending to {}", self.path.display()), e))?;
        match record {
            Record::Add { .. } => self.live += 1,
            _ => self.dead += 1,
        }
        Ok(())
    }

    /// Rewrite the journal to the current live set, atomically
    pub fn compact(&mut self, entries: &BTreeMap<String, CacheEntry>) -> ImagerResult<()> {
        debug!(
            live = entries.len(),
            dead = self.dead,
            "compacting cache journal"
        );
        let tmp_path = self.path.with_extension("journal.tmp");
        {
            let mut tmp = File::create(&tmp_path)
                .map_err(|e| ImagerError::io(format!("creating {}", tmp_path.display()), e))?;
            for entry in entries.values() {
                let record = Record::Add {
                    entry: entry.clone(),
                };
                let mut line = serde_json::to_string(&record)?;
                line.push('\n');
                tmp.write_all(line.as_bytes())
                    .map_err(|e| ImagerError::io("writing compacted journal", e))?;
            }
            tmp.sync_all()
                .map_err(|e| ImagerError::io("syncing compacted journal", e))?;
        }
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| ImagerError::io(format!("replacing {}", self.path.display()), e))?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        self.writer = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| ImagerError::io(format!("reopening {}", self.path.display()), e))?;
        self.live = entries.len();
        self.dead = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::policy::ItemClass;

    fn entry(source: &str) -> CacheEntry {
        CacheEntry::new(ItemClass::File, source, 42)
    }

    #[test]
    fn replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");

        let first = entry("https://h/a.zim");
        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal
                .append(&Record::Add {
                    entry: first.clone(),
                })
                .unwrap();
            journal
                .append(&Record::Add {
                    entry: entry("https://h/b.zim"),
                })
                .unwrap();
            journal
                .append(&Record::Remove {
                    key: entry("https://h/b.zim").key,
                })
                .unwrap();
        }

        let (_, entries) = Journal::open(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key(&first.key));
    }

    #[test]
    fn touch_and_check_update_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        let cached = entry("https://h/a.zim");
        let later = Utc::now() + chrono::Duration::hours(1);

        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal
                .append(&Record::Add {
                    entry: cached.clone(),
                })
                .unwrap();
            journal
                .append(&Record::Touch {
                    key: cached.key.clone(),
                    last_used_on: later,
                    nb_used: 7,
                })
                .unwrap();
            journal
                .append(&Record::Check {
                    key: cached.key.clone(),
                    checked_on: later,
                })
                .unwrap();
        }

        let (_, entries) = Journal::open(&path).unwrap();
        let replayed = &entries[&cached.key];
        assert_eq!(replayed.nb_used, 7);
        assert_eq!(replayed.last_used_on, later);
        assert_eq!(replayed.checked_on, later);
    }

    #[test]
    fn torn_final_line_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        let cached = entry("https://h/a.zim");
        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal
                .append(&Record::Add {
                    entry: cached.clone(),
                })
                .unwrap();
        }
        // simulate a crash mid-append
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"add\",\"entry\":{\"key\":\"trunc").unwrap();
        drop(file);

        let (_, entries) = Journal::open(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key(&cached.key));
    }

    #[test]
    fn corruption_in_middle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        std::fs::write(&path, "not json\n{\"op\":\"remove\",\"key\":\"k\"}\n").unwrap();
        assert!(matches!(
            Journal::open(&path),
            Err(ImagerError::JournalCorrupt(_))
        ));
    }

    #[test]
    fn compaction_keeps_live_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        let keeper = entry("https://h/keep.zim");

        let (mut journal, _) = Journal::open(&path).unwrap();
        let mut entries = BTreeMap::new();
        entries.insert(keeper.key.clone(), keeper.clone());
        journal
            .append(&Record::Add {
                entry: keeper.clone(),
            })
            .unwrap();
        for n in 0..40 {
            journal
                .append(&Record::Touch {
                    key: keeper.key.clone(),
                    last_used_on: Utc::now(),
                    nb_used: n,
                })
                .unwrap();
        }
        journal.compact(&entries).unwrap();

        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 1);
        let (_, replayed) = Journal::open(&path).unwrap();
        assert!(replayed.contains_key(&keeper.key));
    }
}
