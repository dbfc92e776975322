//! Scroll-to-bottom so lazily loaded images materialize before printing.
//!
//! An explicit state machine with an iteration cap: every call to [scroll_to_bottom] ends.

use crate::driver::{Driver, DriverError};
use crate::pacing::Clock;
use serde_json::Value;
use std::time::Duration;

const METRICS_SCRIPT: &str =
    "return [window.pageYOffset, document.body.scrollHeight, window.innerHeight];";

#[derive(Debug, Clone, PartialEq)]
pub struct ScrollSettings {
    pub step_px: u32,
    pub pause: Duration,
    pub max_scrolls: u32,
    /// Distance from the bottom (and minimum movement) that still counts as "there".
    pub tolerance_px: f64,
}

impl Default for ScrollSettings {
    fn default() -> Self {
        Self {
            step_px: 500,
            pause: Duration::from_secs(2),
            max_scrolls: 30,
            tolerance_px: 10.0,
        }
    }
}

/// Scroll position, document height and viewport height, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub offset: f64,
    pub height: f64,
    pub viewport: f64,
}

impl ScrollMetrics {
    fn from_value(v: &Value) -> Result<Self, DriverError> {
        let n = |i: usize| {
            v.get(i)
                .and_then(Value::as_f64)
                .ok_or_else(|| DriverError::Malformed(format!("scroll metrics {}", v)))
        };
        Ok(Self {
            offset: n(0)?,
            height: n(1)?,
            viewport: n(2)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollState {
    /// Ready to issue the next scroll.
    Scrolling,
    /// Scrolled; waiting for content, then measuring.
    Settling,
    Done(ScrollStop),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollStop {
    Bottom,
    /// Height did not grow and the position did not move.
    Stalled,
    Cap,
}

#[derive(Debug, Clone)]
pub struct ScrollMachine {
    settings: ScrollSettings,
    state: ScrollState,
    scrolls: u32,
    last_height: f64,
    last_offset: f64,
}

impl ScrollMachine {
    pub fn new(settings: ScrollSettings, initial: ScrollMetrics) -> Self {
        let state = if settings.max_scrolls == 0 {
            ScrollState::Done(ScrollStop::Cap)
        } else {
            ScrollState::Scrolling
        };
        Self {
            settings,
            state,
            scrolls: 0,
            last_height: initial.height,
            last_offset: initial.offset,
        }
    }

    pub fn state(&self) -> ScrollState {
        self.state
    }

    pub fn scrolls(&self) -> u32 {
        self.scrolls
    }

    /// Scrolling -> Settling. Returns the script to run, or None when not in Scrolling.
    pub fn begin_scroll(&mut self) -> Option<String> {
        if self.state != ScrollState::Scrolling {
            return None;
        }
        self.state = ScrollState::Settling;
        Some(format!("window.scrollBy(0, {});", self.settings.step_px))
    }

    /// Settling -> Scrolling or Done, from the metrics measured after the pause.
    pub fn observe(&mut self, m: ScrollMetrics) -> ScrollState {
        if self.state != ScrollState::Settling {
            return self.state;
        }
        self.scrolls += 1;
        let tolerance = self.settings.tolerance_px;
        let moved = (m.offset - self.last_offset).abs();
        self.last_offset = m.offset;
        self.state = if m.height - (m.offset + m.viewport) < tolerance {
            ScrollState::Done(ScrollStop::Bottom)
        } else if m.height > self.last_height {
            self.last_height = m.height;
            ScrollState::Scrolling
        } else if moved < tolerance {
            ScrollState::Done(ScrollStop::Stalled)
        } else {
            ScrollState::Scrolling
        };
        if self.state == ScrollState::Scrolling && self.scrolls >= self.settings.max_scrolls {
            self.state = ScrollState::Done(ScrollStop::Cap);
        }
        self.state
    }
}

fn measure(driver: &mut dyn Driver) -> Result<ScrollMetrics, DriverError> {
    ScrollMetrics::from_value(&driver.execute_script(METRICS_SCRIPT)?)
}

/// Drive the machine against the current context. Returns why scrolling stopped.
pub fn scroll_to_bottom(
    driver: &mut dyn Driver,
    settings: &ScrollSettings,
    clock: &dyn Clock,
) -> Result<ScrollStop, DriverError> {
    let mut machine = ScrollMachine::new(settings.clone(), measure(driver)?);
    loop {
        match machine.state() {
            ScrollState::Done(stop) => {
                tracing::debug!(scrolls = machine.scrolls(), ?stop, "Scrolling finished");
                return Ok(stop);
            }
            ScrollState::Scrolling => {
                if let Some(script) = machine.begin_scroll() {
                    driver.execute_script(&script)?;
                }
            }
            ScrollState::Settling => {
                clock.sleep(settings.pause);
                let m = measure(driver)?;
                machine.observe(m);
                tracing::trace!(
                    scroll = machine.scrolls(),
                    max = settings.max_scrolls,
                    offset = m.offset,
                    height = m.height,
                    "Scrolled"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::ManualClock;

    fn metrics(offset: f64, height: f64) -> ScrollMetrics {
        ScrollMetrics {
            offset,
            height,
            viewport: 800.0,
        }
    }

    fn step(m: &mut ScrollMachine, after: ScrollMetrics) -> ScrollState {
        assert!(m.begin_scroll().is_some());
        assert_eq!(m.state(), ScrollState::Settling);
        m.observe(after)
    }

    #[test]
    fn stops_at_bottom() {
        let mut m = ScrollMachine::new(ScrollSettings::default(), metrics(0.0, 1800.0));
        assert_eq!(step(&mut m, metrics(500.0, 1800.0)), ScrollState::Scrolling);
        assert_eq!(step(&mut m, metrics(1000.0, 1800.0)), ScrollState::Done(ScrollStop::Bottom));
        assert_eq!(m.scrolls(), 2);
        assert!(m.begin_scroll().is_none());
    }

    #[test]
    fn growth_keeps_scrolling_even_without_movement() {
        let mut m = ScrollMachine::new(ScrollSettings::default(), metrics(0.0, 3000.0));
        assert_eq!(step(&mut m, metrics(0.0, 4000.0)), ScrollState::Scrolling);
        assert_eq!(step(&mut m, metrics(0.0, 4000.0)), ScrollState::Done(ScrollStop::Stalled));
    }

    #[test]
    fn iteration_cap_bounds_endless_pages() {
        let settings = ScrollSettings {
            max_scrolls: 3,
            ..ScrollSettings::default()
        };
        let mut m = ScrollMachine::new(settings, metrics(0.0, 10_000.0));
        let mut height = 10_000.0;
        let mut offset = 0.0;
        let mut last = m.state();
        while !matches!(last, ScrollState::Done(_)) {
            offset += 500.0;
            height += 1_000.0;
            last = step(&mut m, metrics(offset, height));
        }
        assert_eq!(last, ScrollState::Done(ScrollStop::Cap));
        assert_eq!(m.scrolls(), 3);
    }

    #[test]
    fn zero_cap_never_scrolls() {
        let settings = ScrollSettings {
            max_scrolls: 0,
            ..ScrollSettings::default()
        };
        let mut m = ScrollMachine::new(settings, metrics(0.0, 5000.0));
        assert_eq!(m.state(), ScrollState::Done(ScrollStop::Cap));
        assert!(m.begin_scroll().is_none());
    }

    /// Page of fixed height that moves by the requested step.
    struct Page {
        offset: f64,
        height: f64,
    }

    impl Driver for Page {
        fn navigate(&mut self, _url: &str) -> Result<(), DriverError> {
            Ok(())
        }
        fn query_elements(&mut self, _s: &str) -> Result<Vec<crate::driver::Element>, DriverError> {
            Ok(Vec::new())
        }
        fn query_within(
            &mut self,
            _p: &crate::driver::Element,
            _s: &str,
        ) -> Result<Vec<crate::driver::Element>, DriverError> {
            Ok(Vec::new())
        }
        fn click(&mut self, _e: &crate::driver::Element) -> Result<(), DriverError> {
            Ok(())
        }
        fn execute_script(&mut self, script: &str) -> Result<Value, DriverError> {
            if script == METRICS_SCRIPT {
                return Ok(serde_json::json!([self.offset, self.height, 800]));
            }
            self.offset = (self.offset + 500.0).min(self.height - 800.0);
            Ok(Value::Null)
        }
        fn list_contexts(&mut self) -> Result<Vec<crate::driver::ContextId>, DriverError> {
            Ok(Vec::new())
        }
        fn current_context(&mut self) -> Result<crate::driver::ContextId, DriverError> {
            Err(DriverError::Unsupported("contexts"))
        }
        fn open_context(&mut self, _url: &str) -> Result<crate::driver::ContextId, DriverError> {
            Err(DriverError::Unsupported("contexts"))
        }
        fn close_context(&mut self, _id: &crate::driver::ContextId) -> Result<(), DriverError> {
            Ok(())
        }
        fn switch_to_context(&mut self, _id: &crate::driver::ContextId) -> Result<(), DriverError> {
            Ok(())
        }
        fn quit(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[test]
    fn drives_a_page_to_the_bottom_with_pauses() -> Result<(), DriverError> {
        let clock = ManualClock::new();
        let mut page = Page {
            offset: 0.0,
            height: 2300.0,
        };
        let stop = scroll_to_bottom(&mut page, &ScrollSettings::default(), &clock)?;
        assert_eq!(stop, ScrollStop::Bottom);
        assert_eq!(page.offset, 1500.0);
        assert_eq!(clock.slept(), Duration::from_secs(6));
        Ok(())
    }

    #[test]
    fn malformed_metrics_are_an_error() {
        let v = serde_json::json!({"offset": 1});
        assert!(matches!(ScrollMetrics::from_value(&v), Err(DriverError::Malformed(_))));
    }
}
