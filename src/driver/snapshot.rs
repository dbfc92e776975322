//! Offline driver over saved feed pages.
//!
//! Each page is one HTML document captured from the feed (e.g. "Save page as" in the browser).
//! Queries run against the parsed document with CSS selectors; clicking an enabled element
//! replays pagination by loading the next saved page. Scripts and new contexts are not
//! available, so this driver serves discovery only.

use super::{ContextId, Driver, DriverError, Element, ElementId};
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use std::path::Path;

const CONTEXT: &str = "snapshot";

pub struct SnapshotDriver {
    pages: Vec<String>,
    current: usize,
    document: Html,
    visited: Vec<usize>,
    closed: bool,
}

impl SnapshotDriver {
    /// Replay `pages` in order, starting on the first one. An empty list behaves like a blank page.
    pub fn new(pages: Vec<String>) -> Self {
        let document = Html::parse_document(pages.first().map(String::as_str).unwrap_or(""));
        Self {
            pages,
            current: 0,
            document,
            visited: vec![0],
            closed: false,
        }
    }

    /// Load every `*.html` / `*.htm` file in `dir`, ordered by file name.
    pub fn from_dir(dir: &Path) -> std::io::Result<Self> {
        let mut paths = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        paths.sort();
        let pages = paths
            .iter()
            .map(std::fs::read_to_string)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(pages))
    }

    /// Indices of pages loaded so far, in load order.
    pub fn visited_pages(&self) -> &[usize] {
        &self.visited
    }

    fn load(&mut self, index: usize) {
        self.current = index;
        self.document = Html::parse_document(&self.pages[index]);
        self.visited.push(index);
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::SessionLost {
                message: "snapshot context closed".to_string(),
            });
        }
        Ok(())
    }

    fn all_elements(&self) -> Vec<ElementRef<'_>> {
        self.document
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .collect()
    }

    fn resolve(&self, id: &ElementId) -> Result<ElementRef<'_>, DriverError> {
        let stale = || DriverError::NoSuchElement(format!("stale element {}", id.0));
        let (page, index) = id.0.split_once(':').ok_or_else(stale)?;
        if page.parse::<usize>().ok() != Some(self.current) {
            return Err(stale());
        }
        let index: usize = index.parse().map_err(|_| stale())?;
        self.all_elements().get(index).copied().ok_or_else(stale)
    }

    fn snapshot(&self, matched: Vec<ElementRef<'_>>) -> Vec<Element> {
        let all = self.all_elements();
        matched
            .into_iter()
            .filter_map(|el| {
                let index = all.iter().position(|a| a.id() == el.id())?;
                Some(to_element(el, format!("{}:{}", self.current, index)))
            })
            .collect()
    }
}

fn parse_selector(selector: &str) -> Result<Selector, DriverError> {
    Selector::parse(selector)
        .map_err(|e| DriverError::Script(format!("invalid selector {:?}: {}", selector, e)))
}

fn to_element(el: ElementRef<'_>, id: String) -> Element {
    let attributes: BTreeMap<String, String> = el
        .value()
        .attrs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let text = el.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let class = attributes.get("class").map(String::as_str).unwrap_or("");
    let style = attributes
        .get("style")
        .map(|s| s.replace(' ', "").to_ascii_lowercase())
        .unwrap_or_default();
    let enabled = !attributes.contains_key("disabled") && !class.contains("disabled");
    let displayed = !attributes.contains_key("hidden") && !style.contains("display:none");
    Element {
        id: ElementId(id),
        attributes,
        text,
        enabled,
        displayed,
    }
}

impl Driver for SnapshotDriver {
    fn navigate(&mut self, _url: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("navigation outside the recorded pages"))
    }

    fn query_elements(&mut self, selector: &str) -> Result<Vec<Element>, DriverError> {
        self.ensure_open()?;
        let selector = parse_selector(selector)?;
        let matched = self.document.select(&selector).collect();
        Ok(self.snapshot(matched))
    }

    fn query_within(
        &mut self,
        parent: &Element,
        selector: &str,
    ) -> Result<Vec<Element>, DriverError> {
        self.ensure_open()?;
        let selector = parse_selector(selector)?;
        let scope = self.resolve(&parent.id)?;
        let matched = scope.select(&selector).collect();
        Ok(self.snapshot(matched))
    }

    fn click(&mut self, element: &Element) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.resolve(&element.id)?;
        if !element.enabled || !element.displayed {
            return Err(DriverError::NotInteractable(element.text.clone()));
        }
        let next = self.current + 1;
        if next >= self.pages.len() {
            return Err(DriverError::NotInteractable(
                "no further recorded page".to_string(),
            ));
        }
        self.load(next);
        Ok(())
    }

    fn execute_script(&mut self, _script: &str) -> Result<serde_json::Value, DriverError> {
        Err(DriverError::Unsupported("scripts on recorded pages"))
    }

    fn list_contexts(&mut self) -> Result<Vec<ContextId>, DriverError> {
        if self.closed {
            return Ok(Vec::new());
        }
        Ok(vec![ContextId(CONTEXT.to_string())])
    }

    fn current_context(&mut self) -> Result<ContextId, DriverError> {
        self.ensure_open()?;
        Ok(ContextId(CONTEXT.to_string()))
    }

    fn open_context(&mut self, _url: &str) -> Result<ContextId, DriverError> {
        Err(DriverError::Unsupported("opening contexts on recorded pages"))
    }

    fn close_context(&mut self, id: &ContextId) -> Result<(), DriverError> {
        self.ensure_open()?;
        if id.0 == CONTEXT {
            self.closed = true;
        }
        Ok(())
    }

    fn switch_to_context(&mut self, id: &ContextId) -> Result<(), DriverError> {
        self.ensure_open()?;
        if id.0 != CONTEXT {
            return Err(DriverError::SessionLost {
                message: format!("unknown context {}", id),
            });
        }
        Ok(())
    }

    fn quit(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}
