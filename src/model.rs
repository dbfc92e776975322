//! Data model shared by discovery and export.
//!
//! [ItemRecord] is produced by the crawler, journaled and written to the batch manifest, so it
//! is serializable. [ExportJob] only lives for the duration of one export run.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Query parameters that identify an article; everything else is tracking noise.
pub const DEFAULT_KEY_PARAMS: [&str; 4] = ["__biz", "mid", "idx", "sn"];

/// Normalized article link used for deduplication.
///
/// Scheme, host and path (trailing slash trimmed) plus only the required query parameters in
/// the configured order; the fragment is dropped. Equivalent links collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkKey(String);

impl LinkKey {
    /// Normalize `raw`. Returns None when it is not an absolute URL.
    pub fn normalize(raw: &str, required_params: &[String]) -> Option<Self> {
        let mut url = Url::parse(raw.trim()).ok()?;
        url.set_fragment(None);
        let kept: Vec<(String, String)> = required_params
            .iter()
            .filter_map(|name| {
                url.query_pairs()
                    .find(|(k, _)| k == name.as_str())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
            })
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept.iter());
        }
        let path = url.path().to_string();
        if path.len() > 1 && path.ends_with('/') {
            url.set_path(path.trim_end_matches('/'));
        }
        Some(LinkKey(url.to_string()))
    }

    /// Wrap a key that was normalized earlier (e.g. read back from the dedup log).
    pub fn from_normalized(key: impl Into<String>) -> Self {
        LinkKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier stable across runs: `<mid>_<idx>` for query-form links, the last path
    /// segment for short links such as `/s/<token>`.
    pub fn stable_id(&self) -> Option<String> {
        let url = Url::parse(&self.0).ok()?;
        let param = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty())
        };
        if let Some(mid) = param("mid") {
            return Some(match param("idx") {
                Some(idx) => format!("{}_{}", mid, idx),
                None => mid,
            });
        }
        let segments: Vec<&str> = url
            .path_segments()?
            .filter(|s| !s.is_empty())
            .collect();
        if segments.len() >= 2 {
            segments.last().map(|s| s.to_string())
        } else {
            None
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One discovered article. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub key: LinkKey,
    /// Link as found on the page; this is what gets opened for export.
    pub link: String,
    pub title: String,
    /// Feed-native date text, not parsed.
    pub release_date: String,
    pub is_free: bool,
    pub discovered_at: DateTime<Utc>,
}

impl ItemRecord {
    pub fn stable_id(&self) -> Option<String> {
        self.key.stable_id()
    }

    pub fn access_tag(&self) -> &'static str {
        if self.is_free {
            "free"
        } else {
            "paid"
        }
    }
}

/// Export job lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobStatus {
    Pending,
    Rendering,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct ExportJob {
    pub record: ItemRecord,
    /// Sanitized artifact file name, extension included.
    pub target_name: String,
    status: JobStatus,
}

impl ExportJob {
    pub fn new(record: ItemRecord, target_name: String) -> Self {
        Self {
            record,
            target_name,
            status: JobStatus::Pending,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Move to `next`. Returns false (and leaves the job unchanged) for a regression or for any
    /// change out of a terminal state.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if self.status.is_terminal() || next <= self.status {
            return false;
        }
        self.status = next;
        true
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) fn key_params() -> Vec<String> {
        DEFAULT_KEY_PARAMS.iter().map(|s| s.to_string()).collect()
    }

    pub(crate) fn record(link: &str, title: &str, release_date: &str) -> ItemRecord {
        ItemRecord {
            key: LinkKey::normalize(link, &key_params()).expect("fixture link must parse"),
            link: link.to_string(),
            title: title.to_string(),
            release_date: release_date.to_string(),
            is_free: true,
            discovered_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{key_params, record};
    use super::*;

    #[test]
    fn query_noise_and_fragment_collapse_to_one_key() {
        let a = LinkKey::normalize(
            "https://mp.weixin.qq.com/s?__biz=MzA5&mid=2247&idx=1&sn=abc&chksm=ff&scene=27#rd",
            &key_params(),
        );
        let b = LinkKey::normalize(
            "https://mp.weixin.qq.com/s?scene=4&sn=abc&idx=1&mid=2247&__biz=MzA5",
            &key_params(),
        );
        assert!(a.is_some());
        assert_eq!(a, b);
        let key = a.unwrap();
        assert!(!key.as_str().contains("chksm"));
        assert!(!key.as_str().contains('#'));
    }

    #[test]
    fn short_links_drop_query_and_trailing_slash() {
        let a = LinkKey::normalize("https://mp.weixin.qq.com/s/7vLy4wqCIwy/?from=timeline", &key_params());
        assert_eq!(
            a.map(|k| k.as_str().to_string()).as_deref(),
            Some("https://mp.weixin.qq.com/s/7vLy4wqCIwy")
        );
    }

    #[test]
    fn different_articles_stay_distinct() {
        let a = LinkKey::normalize("https://mp.weixin.qq.com/s?__biz=X&mid=1&idx=1&sn=a", &key_params());
        let b = LinkKey::normalize("https://mp.weixin.qq.com/s?__biz=X&mid=1&idx=2&sn=b", &key_params());
        assert_ne!(a, b);
    }

    #[test]
    fn relative_link_is_not_a_key() {
        assert!(LinkKey::normalize("/s/abc", &key_params()).is_none());
    }

    #[test]
    fn stable_id_from_query_or_path() {
        let q = record("https://mp.weixin.qq.com/s?__biz=X&mid=2247&idx=3&sn=a", "t", "");
        assert_eq!(q.stable_id().as_deref(), Some("2247_3"));
        let p = record("https://mp.weixin.qq.com/s/7vLy4wqCIwy", "t", "");
        assert_eq!(p.stable_id().as_deref(), Some("7vLy4wqCIwy"));
        let bare = record("https://mp.weixin.qq.com/s", "t", "");
        assert_eq!(bare.stable_id(), None);
    }

    #[test]
    fn job_status_only_moves_forward() {
        let mut job = ExportJob::new(record("https://mp.weixin.qq.com/s/a1", "t", ""), "t.pdf".into());
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.advance(JobStatus::Rendering));
        assert!(!job.advance(JobStatus::Pending));
        assert!(job.advance(JobStatus::Failed));
        assert!(!job.advance(JobStatus::Succeeded));
        assert_eq!(job.status(), JobStatus::Failed);
    }

    #[test]
    fn pending_job_may_fail_directly() {
        let mut job = ExportJob::new(record("https://mp.weixin.qq.com/s/a1", "t", ""), "t.pdf".into());
        assert!(job.advance(JobStatus::Failed));
        assert!(job.status().is_terminal());
    }

    #[test]
    fn record_serializes_key_as_plain_string() -> Result<(), serde_json::Error> {
        let r = record("https://mp.weixin.qq.com/s/a1", "Title", "2024-01-02");
        let v = serde_json::to_value(&r)?;
        assert_eq!(v["key"], "https://mp.weixin.qq.com/s/a1");
        assert_eq!(v["release_date"], "2024-01-02");
        assert_eq!(v["is_free"], true);
        Ok(())
    }
}
