//! Discovery: walk the paginated feed, keep unseen articles, stop at the date cutoff.

pub mod date_gate;
pub mod extract;

pub use date_gate::{parse_release_date, DateGate, DateParseError};
pub use extract::{extract_page, ExtractRules};

use crate::driver::{Driver, DriverError, Element};
use crate::model::{ItemRecord, DEFAULT_KEY_PARAMS};
use crate::pacing::{CancelFlag, Clock, PageDelay};
use crate::retry::RetryPolicy;
use crate::store::{Store, StoreError};

pub const DEFAULT_ARTICLE_PREFIX: &str = "https://mp.weixin.qq.com/s";
pub const DEFAULT_NEXT_PAGE_LABEL: &str = "下一页";

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub rules: ExtractRules,
    /// Visible text of the pagination control.
    pub next_page_label: String,
    pub page_delay: PageDelay,
    /// Stop after this many pages even if the feed continues.
    pub max_pages: Option<u32>,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            rules: ExtractRules {
                article_prefix: DEFAULT_ARTICLE_PREFIX.to_string(),
                key_params: DEFAULT_KEY_PARAMS.iter().map(|s| s.to_string()).collect(),
            },
            next_page_label: DEFAULT_NEXT_PAGE_LABEL.to_string(),
            page_delay: PageDelay::default(),
            max_pages: None,
        }
    }
}

/// Why discovery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// No usable next-page control.
    EndOfFeed,
    /// An article older than the cutoff was reached; it and everything after it were ignored.
    Cutoff { title: String, release_date: String },
    PageLimit,
    Cancelled,
    /// Unrecoverable failure; articles recorded before it are still in the delta.
    Aborted(String),
}

impl StopReason {
    pub fn is_aborted(&self) -> bool {
        matches!(self, StopReason::Aborted(_))
    }
}

/// Result of a discovery run. `items` is the delta: newly recorded articles in feed order.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub items: Vec<ItemRecord>,
    pub pages_visited: u32,
    pub stop: StopReason,
}

/// Options for a crawl: a hook run for each new article before its key is recorded, and an
/// interrupt checked between pages.
#[derive(Default)]
pub struct CrawlOptions<'a> {
    pub on_new_item: Option<&'a mut dyn FnMut(&ItemRecord) -> Result<(), StoreError>>,
    pub cancel: Option<&'a CancelFlag>,
}

/// Per-page admission counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageOutcome {
    pub seen: usize,
    pub duplicates: usize,
    pub admitted: usize,
    /// The first article older than the cutoff, if one was reached.
    pub gated: Option<ItemRecord>,
}

pub struct PageCrawler<'a> {
    settings: CrawlSettings,
    gate: DateGate,
    retry: RetryPolicy,
    clock: &'a dyn Clock,
}

impl<'a> PageCrawler<'a> {
    pub fn new(settings: CrawlSettings, gate: DateGate, retry: RetryPolicy, clock: &'a dyn Clock) -> Self {
        Self {
            settings,
            gate,
            retry,
            clock,
        }
    }

    /// Article candidates on the current page, in page order.
    pub fn discover_page(&self, driver: &mut dyn Driver) -> Result<Vec<ItemRecord>, DriverError> {
        extract_page(driver, &self.settings.rules, &self.retry, self.clock)
    }

    /// Apply the date gate and the dedup store to one page of candidates, in page order.
    ///
    /// The gate is checked first: once an article is before the cutoff, it and every later
    /// candidate are ignored. New articles go through the hook, then their key is added to the
    /// store, then they are pushed onto `delta`. Keys added before a store failure stay added.
    pub fn admit_page(
        &self,
        candidates: Vec<ItemRecord>,
        store: &mut dyn Store,
        options: &mut CrawlOptions<'_>,
        delta: &mut Vec<ItemRecord>,
    ) -> Result<PageOutcome, StoreError> {
        let mut outcome = PageOutcome {
            seen: candidates.len(),
            ..PageOutcome::default()
        };
        for record in candidates {
            if self.gate.is_before_cutoff(&record.release_date) {
                outcome.gated = Some(record);
                break;
            }
            if store.contains(&record.key) {
                outcome.duplicates += 1;
                continue;
            }
            if let Some(hook) = options.on_new_item.as_deref_mut() {
                hook(&record)?;
            }
            store.add(&record.key)?;
            tracing::debug!(title = %record.title, date = %record.release_date, "New article");
            outcome.admitted += 1;
            delta.push(record);
        }
        Ok(outcome)
    }

    /// The first enabled, visible control whose text carries the next-page label.
    pub fn find_next(&self, driver: &mut dyn Driver) -> Result<Option<Element>, DriverError> {
        let label = self.settings.next_page_label.as_str();
        let anchors = self
            .retry
            .run(self.clock, "find next page", || driver.query_elements("a"))?;
        let mut present = false;
        for a in anchors {
            if !a.text.contains(label) {
                continue;
            }
            if a.enabled && a.displayed {
                return Ok(Some(a));
            }
            present = true;
        }
        if present {
            tracing::debug!("Next page control is disabled");
        }
        Ok(None)
    }

    /// Walk the feed from the page the driver is on until the cutoff, the end of the feed, the
    /// page limit or cancellation.
    pub fn crawl(
        &self,
        driver: &mut dyn Driver,
        store: &mut dyn Store,
        options: &mut CrawlOptions<'_>,
    ) -> Discovery {
        let mut items = Vec::new();
        let mut page: u32 = 0;
        let stop = loop {
            if options.cancel.map(CancelFlag::is_cancelled).unwrap_or(false) {
                tracing::info!("Discovery cancelled");
                break StopReason::Cancelled;
            }
            page += 1;
            tracing::info!(page, "Processing feed page");
            let candidates = match self.discover_page(driver) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(page, error = %e, "Cannot read feed page");
                    break StopReason::Aborted(e.to_string());
                }
            };
            let outcome = match self.admit_page(candidates, store, options, &mut items) {
                Ok(o) => o,
                Err(e) => {
                    tracing::error!(page, error = %e, "Cannot record article");
                    break StopReason::Aborted(e.to_string());
                }
            };
            tracing::info!(
                page,
                found = outcome.seen,
                new = outcome.admitted,
                duplicates = outcome.duplicates,
                "Page processed"
            );
            if let Some(gated) = outcome.gated {
                tracing::info!(
                    title = %gated.title,
                    date = %gated.release_date,
                    cutoff = %self.gate.cutoff(),
                    "Reached an article older than the cutoff; stopping discovery"
                );
                break StopReason::Cutoff {
                    title: gated.title,
                    release_date: gated.release_date,
                };
            }
            if self.settings.max_pages.map(|m| page >= m).unwrap_or(false) {
                tracing::info!(page, "Page limit reached");
                break StopReason::PageLimit;
            }
            match self.advance(driver) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(page, "No next page; end of feed");
                    break StopReason::EndOfFeed;
                }
                Err(e) => {
                    tracing::error!(page, error = %e, "Cannot move to the next page");
                    break StopReason::Aborted(e.to_string());
                }
            }
            let delay = self.settings.page_delay.sample();
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before next page");
            self.clock.sleep(delay);
        };
        Discovery {
            items,
            pages_visited: page,
            stop,
        }
    }

    /// Click the next-page control. Ok(false) when there is none or it cannot be clicked.
    /// Clicks are not retried: a click that timed out may still have advanced the feed.
    fn advance(&self, driver: &mut dyn Driver) -> Result<bool, DriverError> {
        let Some(next) = self.find_next(driver)? else {
            return Ok(false);
        };
        match driver.click(&next) {
            Ok(()) => Ok(true),
            Err(DriverError::NotInteractable(reason)) | Err(DriverError::NoSuchElement(reason)) => {
                tracing::debug!(%reason, "Next page control not clickable");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
