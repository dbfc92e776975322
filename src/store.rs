//! Persistent set of article keys seen by earlier runs.
//!
//! The durable form is an append-only UTF-8 log with one normalized key per line. Each `add`
//! appends, flushes and syncs before returning, so a crash loses at most the append in flight.

use crate::model::LinkKey;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Deduplication set. Keys are never removed.
pub trait Store {
    fn contains(&self, key: &LinkKey) -> bool;

    /// Record `key`; visible to `contains` immediately. Returns false if it was already present.
    fn add(&mut self, key: &LinkKey) -> Result<bool, StoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Non-durable store for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    keys: HashSet<LinkKey>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &LinkKey> {
        self.keys.iter()
    }
}

impl Store for MemoryStore {
    fn contains(&self, key: &LinkKey) -> bool {
        self.keys.contains(key)
    }

    fn add(&mut self, key: &LinkKey) -> Result<bool, StoreError> {
        Ok(self.keys.insert(key.clone()))
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Append-only, line-per-key log.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: File,
    keys: HashSet<LinkKey>,
}

impl FileStore {
    /// Load every recorded key and open the log for appending, creating it (and its parent
    /// directory) if missing. A final line without its newline was torn by a crash: it is
    /// ignored and terminated so the next append starts on a fresh line.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let write_err = |source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(write_err)?;
            }
        }
        let (keys, torn) = load_all(path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(write_err)?;
        if torn {
            tracing::warn!(path = %path.display(), "Dedup log ends with a partial entry; ignoring it");
            file.write_all(b"\n").map_err(write_err)?;
            file.sync_data().map_err(write_err)?;
        }
        tracing::debug!(path = %path.display(), keys = keys.len(), "Dedup log loaded");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            keys,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read the log into a set. Returns the set and whether the last line was torn.
pub fn load_all(path: &Path) -> Result<(HashSet<LinkKey>, bool), StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((HashSet::new(), false)),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let torn = !content.is_empty() && !content.ends_with('\n');
    let mut lines: Vec<&str> = content.lines().collect();
    if torn {
        lines.pop();
    }
    let keys = lines
        .into_iter()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(LinkKey::from_normalized)
        .collect();
    Ok((keys, torn))
}

impl Store for FileStore {
    fn contains(&self, key: &LinkKey) -> bool {
        self.keys.contains(key)
    }

    fn add(&mut self, key: &LinkKey) -> Result<bool, StoreError> {
        if self.keys.contains(key) {
            return Ok(false);
        }
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        let mut line = String::with_capacity(key.as_str().len() + 1);
        line.push_str(key.as_str());
        line.push('\n');
        self.file.write_all(line.as_bytes()).map_err(write_err)?;
        self.file.flush().map_err(write_err)?;
        self.file.sync_data().map_err(write_err)?;
        self.keys.insert(key.clone());
        Ok(true)
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn key(s: &str) -> LinkKey {
        LinkKey::from_normalized(s)
    }

    #[test]
    fn memory_store_reports_new_once() -> Result<(), StoreError> {
        let mut s = MemoryStore::new();
        assert!(s.add(&key("https://mp.weixin.qq.com/s/a"))?);
        assert!(!s.add(&key("https://mp.weixin.qq.com/s/a"))?);
        assert!(s.contains(&key("https://mp.weixin.qq.com/s/a")));
        assert_eq!(s.len(), 1);
        Ok(())
    }

    #[test]
    fn file_store_survives_reopen() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state").join("seen_links.log");
        {
            let mut s = FileStore::open(&path)?;
            assert!(s.is_empty());
            s.add(&key("https://mp.weixin.qq.com/s/a"))?;
            s.add(&key("https://mp.weixin.qq.com/s/b"))?;
            s.add(&key("https://mp.weixin.qq.com/s/a"))?;
            assert!(s.contains(&key("https://mp.weixin.qq.com/s/b")));
        }
        let s = FileStore::open(&path)?;
        assert_eq!(s.len(), 2);
        assert!(s.contains(&key("https://mp.weixin.qq.com/s/a")));
        let content = std::fs::read_to_string(&path)?;
        assert_eq!(content.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn torn_last_line_is_dropped_and_terminated() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("seen_links.log");
        std::fs::write(&path, "https://mp.weixin.qq.com/s/a\nhttps://mp.weixin.qq.com/s/b-trunc")?;
        {
            let mut s = FileStore::open(&path)?;
            assert_eq!(s.len(), 1);
            assert!(!s.contains(&key("https://mp.weixin.qq.com/s/b-trunc")));
            s.add(&key("https://mp.weixin.qq.com/s/c"))?;
        }
        let (keys, torn) = load_all(&path)?;
        assert!(!torn);
        assert!(keys.contains(&key("https://mp.weixin.qq.com/s/c")));
        assert!(keys.contains(&key("https://mp.weixin.qq.com/s/a")));
        assert!(!keys.contains(&key("https://mp.weixin.qq.com/s/b-trunchttps://mp.weixin.qq.com/s/c")));
        Ok(())
    }

    #[test]
    fn blank_lines_and_whitespace_ignored() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("seen_links.log");
        std::fs::write(&path, "\n  https://mp.weixin.qq.com/s/a  \n\n")?;
        let (keys, torn) = load_all(&path)?;
        assert!(!torn);
        assert_eq!(keys.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_log_is_empty() -> Result<(), StoreError> {
        let (keys, torn) = load_all(Path::new("/nonexistent_mparchive_dir/seen.log"))?;
        assert!(keys.is_empty());
        assert!(!torn);
        Ok(())
    }
}
