//! Scripted printing engine for export and pipeline tests.

use super::BLANK_PAGE;
use crate::driver::{ContextId, Driver, DriverError, Element};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Browser state shared between a fake engine and the test.
#[derive(Default)]
pub(crate) struct Browser {
    pub(crate) contexts: Vec<(ContextId, String)>,
    pub(crate) current: Option<ContextId>,
    next_id: u32,
    pub(crate) printed: Vec<String>,
    /// Number of upcoming `open_context` calls that create the window but then time out
    /// loading the page.
    pub(crate) open_timeouts: u32,
}

/// Printing engine that writes the file on `window.print()`. Links decide the behavior:
/// `hang` never produces a file, `close-tab` closes the job's tab while printing,
/// `close-all` closes every window, `close-others` closes every other window.
pub(crate) struct FakeEngine {
    dir: PathBuf,
    browser: Rc<RefCell<Browser>>,
}

impl FakeEngine {
    pub(crate) fn launch(dir: &Path, browser: Rc<RefCell<Browser>>) -> Self {
        {
            let mut b = browser.borrow_mut();
            b.contexts.clear();
            let first = ContextId("w0".to_string());
            b.contexts.push((first.clone(), BLANK_PAGE.to_string()));
            b.current = Some(first);
            b.next_id = 1;
        }
        Self {
            dir: dir.to_path_buf(),
            browser,
        }
    }

    fn current_url(&self) -> Option<String> {
        let b = self.browser.borrow();
        let current = b.current.as_ref()?;
        b.contexts
            .iter()
            .find(|(id, _)| id == current)
            .map(|(_, url)| url.clone())
    }

    fn lost() -> DriverError {
        DriverError::SessionLost {
            message: "no such window".to_string(),
        }
    }
}

impl Driver for FakeEngine {
    fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        let mut b = self.browser.borrow_mut();
        let current = b.current.clone().ok_or_else(Self::lost)?;
        match b.contexts.iter_mut().find(|(id, _)| *id == current) {
            Some(ctx) => {
                ctx.1 = url.to_string();
                Ok(())
            }
            None => Err(Self::lost()),
        }
    }

    fn query_elements(&mut self, _s: &str) -> Result<Vec<Element>, DriverError> {
        Ok(Vec::new())
    }

    fn query_within(&mut self, _p: &Element, _s: &str) -> Result<Vec<Element>, DriverError> {
        Ok(Vec::new())
    }

    fn click(&mut self, _e: &Element) -> Result<(), DriverError> {
        Ok(())
    }

    fn execute_script(&mut self, script: &str) -> Result<Value, DriverError> {
        let url = self.current_url().ok_or_else(Self::lost)?;
        if script.starts_with("return [window.pageYOffset") {
            return Ok(json!([0, 800, 800]));
        }
        let Some(rest) = script.strip_prefix("document.title = ") else {
            return Ok(Value::Null);
        };
        let literal = rest.trim_end_matches(" window.print();").trim_end_matches(';');
        let name: String =
            serde_json::from_str(literal).map_err(|e| DriverError::Script(e.to_string()))?;
        {
            let mut b = self.browser.borrow_mut();
            let current = b.current.clone();
            if url.contains("close-all") {
                b.contexts.clear();
                b.current = None;
                return Err(Self::lost());
            }
            if url.contains("close-tab") {
                b.contexts.retain(|(id, _)| Some(id) != current.as_ref());
                return Err(Self::lost());
            }
            if url.contains("close-others") {
                b.contexts.retain(|(id, _)| Some(id) == current.as_ref());
            }
            b.printed.push(name.clone());
        }
        if !url.contains("hang") {
            std::fs::write(self.dir.join(&name), b"%PDF-1.7 fake")
                .map_err(|e| DriverError::Script(e.to_string()))?;
        }
        Ok(Value::Null)
    }

    fn list_contexts(&mut self) -> Result<Vec<ContextId>, DriverError> {
        Ok(self.browser.borrow().contexts.iter().map(|(id, _)| id.clone()).collect())
    }

    fn current_context(&mut self) -> Result<ContextId, DriverError> {
        self.browser.borrow().current.clone().ok_or_else(Self::lost)
    }

    fn open_context(&mut self, url: &str) -> Result<ContextId, DriverError> {
        let mut b = self.browser.borrow_mut();
        let id = ContextId(format!("w{}", b.next_id));
        b.next_id += 1;
        b.contexts.push((id.clone(), url.to_string()));
        b.current = Some(id.clone());
        if b.open_timeouts > 0 {
            b.open_timeouts -= 1;
            return Err(DriverError::Timeout {
                operation: format!("navigate {}", url),
                message: "page load timed out".to_string(),
            });
        }
        Ok(id)
    }

    fn close_context(&mut self, id: &ContextId) -> Result<(), DriverError> {
        let mut b = self.browser.borrow_mut();
        b.contexts.retain(|(c, _)| c != id);
        if b.current.as_ref() == Some(id) {
            b.current = None;
        }
        Ok(())
    }

    fn switch_to_context(&mut self, id: &ContextId) -> Result<(), DriverError> {
        let mut b = self.browser.borrow_mut();
        if !b.contexts.iter().any(|(c, _)| c == id) {
            return Err(Self::lost());
        }
        b.current = Some(id.clone());
        Ok(())
    }

    fn quit(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

pub(crate) struct Harness {
    pub(crate) dir: tempfile::TempDir,
    pub(crate) browser: Rc<RefCell<Browser>>,
    pub(crate) launches: Rc<Cell<u32>>,
}

impl Harness {
    pub(crate) fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
            browser: Rc::new(RefCell::new(Browser::default())),
            launches: Rc::new(Cell::new(0)),
        })
    }

    /// Factory that succeeds for the first `allowed` launches.
    pub(crate) fn factory(&self, allowed: u32) -> impl FnMut() -> Result<Box<dyn Driver>, DriverError> {
        let dir = self.dir.path().to_path_buf();
        let browser = Rc::clone(&self.browser);
        let launches = Rc::clone(&self.launches);
        move || {
            launches.set(launches.get() + 1);
            if launches.get() > allowed {
                return Err(DriverError::Unsupported("chromedriver unreachable"));
            }
            Ok(Box::new(FakeEngine::launch(&dir, Rc::clone(&browser))) as Box<dyn Driver>)
        }
    }

    pub(crate) fn pdfs(&self) -> usize {
        std::fs::read_dir(self.dir.path())
            .map(|d| d.filter_map(Result::ok).count())
            .unwrap_or(0)
    }
}

