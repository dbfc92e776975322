//! Article extraction from the currently loaded feed page.
//!
//! A fallback chain of strategies, strictest first; the first one that yields any article wins.

use crate::driver::{Driver, DriverError, Element};
use crate::model::{ItemRecord, LinkKey};
use crate::pacing::Clock;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;

const ITEM_SELECTOR: &str = "label.inner_link_article_item";
const LOOSE_ITEM_SELECTOR: &str = "div[class*=\"inner_link_article_item\"]";
const TITLE_SPAN_SELECTOR: &str = "div.inner_link_article_title > span:nth-of-type(2)";
const TITLE_SELECTOR: &str = "div.inner_link_article_title";
const LINK_SELECTOR: &str = "div.inner_link_article_date a[href]";
const DATE_SELECTOR: &str = "div.inner_link_article_date > span:nth-of-type(1)";
const PAY_TAG_SELECTOR: &str = "div.inner_link_article_title div.weui-desktop-key-tag_pay";
const PAY_TAG_TEXT: &str = "付费";
const RAW_LINK_SELECTOR: &str = "a[href]";

/// Extraction strategy, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `label.inner_link_article_item` containers.
    Structural,
    /// Any `div` whose class mentions `inner_link_article_item`.
    Attribute,
    /// Bare article anchors; no date, title from the anchor text.
    RawLinks,
}

pub const FALLBACK_CHAIN: [Strategy; 3] =
    [Strategy::Structural, Strategy::Attribute, Strategy::RawLinks];

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("strategy {0:?} found no articles")]
    NothingFound(Strategy),

    #[error("article container has no {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// What counts as an article link and how it is keyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRules {
    pub article_prefix: String,
    pub key_params: Vec<String>,
}

impl ExtractRules {
    fn key_for(&self, link: &str) -> Option<LinkKey> {
        if !link.starts_with(&self.article_prefix) {
            tracing::debug!(link, "Not an article link; skipped");
            return None;
        }
        LinkKey::normalize(link, &self.key_params)
    }
}

struct Extraction<'a> {
    driver: &'a mut dyn Driver,
    rules: &'a ExtractRules,
    retry: &'a RetryPolicy,
    clock: &'a dyn Clock,
    now: DateTime<Utc>,
}

/// Articles on the current page, in page order. Only a lost session is an error; anything
/// else degrades to the next strategy and finally to an empty page.
pub fn extract_page(
    driver: &mut dyn Driver,
    rules: &ExtractRules,
    retry: &RetryPolicy,
    clock: &dyn Clock,
) -> Result<Vec<ItemRecord>, DriverError> {
    let mut ex = Extraction {
        driver,
        rules,
        retry,
        clock,
        now: Utc::now(),
    };
    for strategy in FALLBACK_CHAIN {
        match ex.run(strategy) {
            Ok(items) if !items.is_empty() => {
                tracing::debug!(?strategy, count = items.len(), "Articles extracted");
                return Ok(items);
            }
            Ok(_) => tracing::debug!("{}", ExtractionError::NothingFound(strategy)),
            Err(ExtractionError::Driver(e)) if e.is_session_lost() => return Err(e),
            Err(e) => tracing::warn!(?strategy, error = %e, "Extraction strategy failed"),
        }
    }
    tracing::warn!("No articles found on this page");
    Ok(Vec::new())
}

impl Extraction<'_> {
    fn run(&mut self, strategy: Strategy) -> Result<Vec<ItemRecord>, ExtractionError> {
        match strategy {
            Strategy::Structural => self.from_containers(ITEM_SELECTOR),
            Strategy::Attribute => self.from_containers(LOOSE_ITEM_SELECTOR),
            Strategy::RawLinks => self.from_raw_links(),
        }
    }

    fn query(&mut self, selector: &str) -> Result<Vec<Element>, DriverError> {
        let driver = &mut *self.driver;
        self.retry
            .run(self.clock, "query elements", || driver.query_elements(selector))
    }

    fn query_within(&mut self, parent: &Element, selector: &str) -> Result<Vec<Element>, DriverError> {
        let driver = &mut *self.driver;
        self.retry
            .run(self.clock, "query within", || driver.query_within(parent, selector))
    }

    fn from_containers(&mut self, selector: &str) -> Result<Vec<ItemRecord>, ExtractionError> {
        let containers = self.query(selector)?;
        let mut items = Vec::with_capacity(containers.len());
        for container in &containers {
            match self.from_container(container) {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(ExtractionError::Driver(e)) if e.is_session_lost() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(error = %e, text = %preview(&container.text), "Skipping article container");
                }
            }
        }
        Ok(items)
    }

    fn from_container(&mut self, container: &Element) -> Result<Option<ItemRecord>, ExtractionError> {
        let link = self
            .query_within(container, LINK_SELECTOR)?
            .into_iter()
            .find_map(|a| a.attr("href").map(str::to_string))
            .ok_or(ExtractionError::MissingField("link"))?;
        let key = match self.rules.key_for(&link) {
            Some(k) => k,
            None => return Ok(None),
        };
        let title = match self
            .query_within(container, TITLE_SPAN_SELECTOR)?
            .into_iter()
            .map(|e| e.text)
            .find(|t| !t.is_empty())
        {
            Some(t) => t,
            None => self
                .query_within(container, TITLE_SELECTOR)?
                .into_iter()
                .next()
                .map(|e| e.text)
                .unwrap_or_default(),
        };
        let release_date = self
            .query_within(container, DATE_SELECTOR)?
            .into_iter()
            .next()
            .map(|e| e.text)
            .unwrap_or_default();
        let is_free = !self
            .query_within(container, PAY_TAG_SELECTOR)?
            .iter()
            .any(|tag| tag.text.contains(PAY_TAG_TEXT));
        Ok(Some(ItemRecord {
            key,
            link,
            title,
            release_date,
            is_free,
            discovered_at: self.now,
        }))
    }

    fn from_raw_links(&mut self) -> Result<Vec<ItemRecord>, ExtractionError> {
        let anchors = self.query(RAW_LINK_SELECTOR)?;
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for a in anchors {
            let Some(link) = a.attr("href") else { continue };
            let Some(key) = self.rules.key_for(link) else { continue };
            if !seen.insert(key.clone()) {
                continue;
            }
            items.push(ItemRecord {
                key,
                link: link.to_string(),
                title: a.text.clone(),
                release_date: String::new(),
                is_free: true,
                discovered_at: self.now,
            });
        }
        Ok(items)
    }
}

fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}


#[cfg(test)]
mod tests {
    use super::fixtures::{item_html, page_html};
    use super::*;
    use crate::driver::SnapshotDriver;
    use crate::model::fixtures::key_params;
    use crate::pacing::ManualClock;

    fn rules() -> ExtractRules {
        ExtractRules {
            article_prefix: "https://mp.weixin.qq.com/s".to_string(),
            key_params: key_params(),
        }
    }

    fn extract(html: &str) -> Result<Vec<ItemRecord>, DriverError> {
        let mut driver = SnapshotDriver::new(vec![html.to_string()]);
        extract_page(&mut driver, &rules(), &RetryPolicy::none(), &ManualClock::new())
    }

    #[test]
    fn structural_strategy_reads_all_fields() -> Result<(), DriverError> {
        let html = page_html(
            &[
                item_html("https://mp.weixin.qq.com/s/aaa", "First", "2024-05-01", false),
                item_html("https://mp.weixin.qq.com/s?__biz=X&mid=9&idx=1&sn=z&chksm=q", "Second", "2024/04/30", true),
            ],
            true,
        );
        let items = extract(&html)?;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "First");
        assert_eq!(items[0].release_date, "2024-05-01");
        assert!(items[0].is_free);
        assert_eq!(items[1].title, "Second");
        assert!(!items[1].is_free);
        assert!(!items[1].key.as_str().contains("chksm"));
        assert_eq!(items[1].link, "https://mp.weixin.qq.com/s?__biz=X&mid=9&idx=1&sn=z&chksm=q");
        Ok(())
    }

    #[test]
    fn foreign_links_are_dropped_silently() -> Result<(), DriverError> {
        let html = page_html(
            &[
                item_html("https://example.com/s/aaa", "Elsewhere", "2024-05-01", false),
                item_html("https://mp.weixin.qq.com/s/bbb", "Kept", "2024-05-01", false),
            ],
            false,
        );
        let items = extract(&html)?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Kept");
        Ok(())
    }

    #[test]
    fn attribute_strategy_used_when_structure_differs() -> Result<(), DriverError> {
        let html = r#"<html><body>
<div class="inner_link_article_item item_v2">
  <div class="inner_link_article_title">Only title text</div>
  <div class="inner_link_article_date"><span>2023-01-01</span><a href="https://mp.weixin.qq.com/s/ccc">x</a></div>
</div></body></html>"#;
        let items = extract(html)?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Only title text");
        assert_eq!(items[0].release_date, "2023-01-01");
        Ok(())
    }

    #[test]
    fn raw_links_are_last_resort_and_deduplicated() -> Result<(), DriverError> {
        let html = r#"<html><body>
<a href="https://mp.weixin.qq.com/s/ddd">Loose one</a>
<a href="https://mp.weixin.qq.com/s/ddd#again">Loose one again</a>
<a href="https://example.com/">not an article</a>
</body></html>"#;
        let items = extract(html)?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Loose one");
        assert!(items[0].release_date.is_empty());
        Ok(())
    }

    #[test]
    fn later_strategies_not_tried_once_one_succeeds() -> Result<(), DriverError> {
        let html = page_html(
            &[item_html("https://mp.weixin.qq.com/s/eee", "Structured", "2024-01-01", false)],
            false,
        ) + r#"<a href="https://mp.weixin.qq.com/s/fff">stray</a>"#;
        let items = extract(&html)?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Structured");
        Ok(())
    }

    #[test]
    fn container_without_link_is_skipped() -> Result<(), DriverError> {
        let broken = r#"<label class="inner_link_article_item"><div class="inner_link_article_title"><span></span><span>No link</span></div></label>"#;
        let html = page_html(
            &[
                broken.to_string(),
                item_html("https://mp.weixin.qq.com/s/ggg", "Good", "2024-01-01", false),
            ],
            false,
        );
        let items = extract(&html)?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Good");
        Ok(())
    }

    #[test]
    fn empty_page_yields_nothing() -> Result<(), DriverError> {
        assert!(extract("<html><body><p>登录超时</p></body></html>")?.is_empty());
        Ok(())
    }
}
