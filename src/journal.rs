//! Pending-export journal.
//!
//! A newly discovered article is journaled before its key enters the dedup store, and marked
//! done once an export attempt finished (successfully or not). Entries still outstanding when
//! the journal is opened belong to a run that was interrupted between discovery and export;
//! they are exported again ahead of the next run's delta.

use crate::model::{ItemRecord, LinkKey};
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Entry {
    Pending { record: ItemRecord },
    Done { key: LinkKey },
}

#[derive(Debug)]
pub struct PendingJournal {
    path: PathBuf,
    file: File,
}

impl PendingJournal {
    /// Open (or create) the journal and return it with the records still awaiting export, in
    /// the order they were discovered. Unreadable lines are skipped.
    pub fn open(path: &Path) -> Result<(Self, Vec<ItemRecord>), StoreError> {
        let outstanding = read_outstanding(path)?;
        let write_err = |source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(write_err)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(write_err)?;
        if ends_without_newline(path) {
            file.write_all(b"\n").map_err(write_err)?;
        }
        if !outstanding.is_empty() {
            tracing::info!(count = outstanding.len(), "Articles left over from an interrupted run");
        }
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
            },
            outstanding,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_pending(&mut self, record: &ItemRecord) -> Result<(), StoreError> {
        self.append(&Entry::Pending {
            record: record.clone(),
        })
    }

    pub fn mark_done(&mut self, key: &LinkKey) -> Result<(), StoreError> {
        self.append(&Entry::Done { key: key.clone() })
    }

    fn append(&mut self, entry: &Entry) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        let mut line = serde_json::to_string(entry)
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).map_err(write_err)?;
        self.file.flush().map_err(write_err)?;
        self.file.sync_data().map_err(write_err)
    }

    /// Rewrite the journal with only the outstanding entries, atomically. Returns how many remain.
    pub fn compact(&mut self) -> Result<usize, StoreError> {
        let outstanding = read_outstanding(&self.path)?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        for record in &outstanding {
            let line = serde_json::to_string(&Entry::Pending {
                record: record.clone(),
            })
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
            writeln!(tmp, "{}", line).map_err(write_err)?;
        }
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;
        tracing::debug!(remaining = outstanding.len(), "Journal compacted");
        Ok(outstanding.len())
    }
}

fn ends_without_newline(path: &Path) -> bool {
    std::fs::read(path)
        .map(|b| !b.is_empty() && !b.ends_with(b"\n"))
        .unwrap_or(false)
}

/// Pending records without a later done marker, first occurrence order.
fn read_outstanding(path: &Path) -> Result<Vec<ItemRecord>, StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut pending: Vec<ItemRecord> = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Entry>(line) {
            Ok(Entry::Pending { record }) => {
                if !pending.iter().any(|r| r.key == record.key) {
                    pending.push(record);
                }
            }
            Ok(Entry::Done { key }) => {
                pending.retain(|r| r.key != key);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), line = n + 1, error = %e, "Skipping unreadable journal entry");
            }
        }
    }
    Ok(pending)
}
