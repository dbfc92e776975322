//! Narrow capability interface over a remote browser, plus the adapters that implement it.
//!
//! The crawler and the exporter only ever talk to [Driver]; they never see WebDriver
//! JSON or HTML parsing. [WebDriverSession] drives a real Chrome through chromedriver,
//! [SnapshotDriver] replays saved feed pages offline.

mod error;
pub mod snapshot;
pub mod webdriver;

pub use error::DriverError;
pub use snapshot::SnapshotDriver;
pub use webdriver::{WebDriverBuilder, WebDriverSession};

use std::collections::BTreeMap;
use std::fmt;

/// Opaque handle of one element, valid until the page it came from is replaced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementId(pub String);

/// Opaque handle of one rendering context (window or tab).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(pub String);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of an element taken when it was queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub id: ElementId,
    pub attributes: BTreeMap<String, String>,
    /// Rendered text, trimmed.
    pub text: String,
    pub enabled: bool,
    pub displayed: bool,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Everything the core needs from a browser-like automation surface.
pub trait Driver {
    /// Load `url` in the current context.
    fn navigate(&mut self, url: &str) -> Result<(), DriverError>;

    /// All elements matching a CSS selector in the current context, in document order.
    fn query_elements(&mut self, selector: &str) -> Result<Vec<Element>, DriverError>;

    /// Elements matching a CSS selector below `parent`, in document order.
    fn query_within(
        &mut self,
        parent: &Element,
        selector: &str,
    ) -> Result<Vec<Element>, DriverError>;

    fn click(&mut self, element: &Element) -> Result<(), DriverError>;

    /// Run a script body (it may `return` a value) in the current context.
    fn execute_script(&mut self, script: &str) -> Result<serde_json::Value, DriverError>;

    fn list_contexts(&mut self) -> Result<Vec<ContextId>, DriverError>;

    fn current_context(&mut self) -> Result<ContextId, DriverError>;

    /// Open `url` in a new context and make it current. Other contexts are left alone.
    fn open_context(&mut self, url: &str) -> Result<ContextId, DriverError>;

    fn close_context(&mut self, id: &ContextId) -> Result<(), DriverError>;

    fn switch_to_context(&mut self, id: &ContextId) -> Result<(), DriverError>;

    /// Tear down the engine. Best effort; adapters that share a user's browser only detach.
    fn quit(&mut self) -> Result<(), DriverError>;
}

/// Creates rendering engines: the first one for an export run and replacements after a crash.
pub trait EngineFactory {
    fn launch(&mut self) -> Result<Box<dyn Driver>, DriverError>;
}

impl<F> EngineFactory for F
where
    F: FnMut() -> Result<Box<dyn Driver>, DriverError>,
{
    fn launch(&mut self) -> Result<Box<dyn Driver>, DriverError> {
        self()
    }
}
