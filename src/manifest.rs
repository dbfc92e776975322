//! Per-run batch manifest: the delta of one discovery run as mparchive's own JSON document.
//!
//! One object per run with `account_name`, `collected_at` (RFC 3339, UTC) and `articles`; each
//! article carries `account_name`, `title`, `link`, `release_date`, `is_free` (bool) and
//! `collected_at`. It is not the CSV layout older MySQL import scripts expect.

use crate::model::ItemRecord;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub account_name: String,
    pub title: String,
    pub link: String,
    pub release_date: String,
    pub is_free: bool,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchManifest {
    pub account_name: String,
    pub collected_at: DateTime<Utc>,
    pub articles: Vec<ManifestEntry>,
}

impl BatchManifest {
    pub fn new(account_name: &str, items: &[ItemRecord]) -> Self {
        Self {
            account_name: account_name.to_string(),
            collected_at: Utc::now(),
            articles: items
                .iter()
                .map(|r| ManifestEntry {
                    account_name: account_name.to_string(),
                    title: r.title.clone(),
                    link: r.link.clone(),
                    release_date: r.release_date.clone(),
                    is_free: r.is_free,
                    collected_at: r.discovered_at,
                })
                .collect(),
        }
    }

    /// `links_<YYYYmmddHHMMSS>.json`, local time.
    pub fn file_name(at: DateTime<Local>) -> String {
        format!("links_{}.json", at.format("%Y%m%d%H%M%S"))
    }

    /// Write into `dir` (created if missing) and return the path.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(self.collected_at.with_timezone(&Local)));
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        tracing::info!(path = %path.display(), count = self.articles.len(), "Batch manifest written");
        Ok(path)
    }
}
