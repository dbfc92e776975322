//! W3C WebDriver adapter (chromedriver) over a blocking HTTP client.
//!
//! Two session shapes are used: one attached to the user's already logged-in Chrome through
//! its remote debugging address (discovery), and one that launches a kiosk-printing Chrome
//! whose print-to-PDF destination is the artifact directory (export).

use super::{ContextId, Driver, DriverError, Element, ElementId};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const DEFAULT_WEBDRIVER_URL: &str = "http://127.0.0.1:9515";
/// Generous: `window.print()` in kiosk mode blocks the command until the PDF is spooled.
const DEFAULT_TIMEOUT_SECS: u64 = 120;
/// W3C web element identifier key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Serializes matched elements into [Element] snapshots in one round trip.
const SNAPSHOT_SCRIPT: &str = r#"return arguments[0].map(function (el) {
  var attrs = {};
  for (var i = 0; i < el.attributes.length; i++) {
    attrs[el.attributes[i].name] = el.attributes[i].value;
  }
  if (typeof el.href === 'string' && el.href) { attrs.href = el.href; }
  var cls = typeof el.className === 'string' ? el.className : '';
  return {
    attributes: attrs,
    text: (el.innerText || el.textContent || '').trim(),
    enabled: !el.disabled && cls.indexOf('disabled') === -1,
    displayed: !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length)
  };
});"#;

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    displayed: bool,
}

/// One chromedriver session.
#[derive(Debug)]
pub struct WebDriverSession {
    http: reqwest::blocking::Client,
    base: String,
    session_id: String,
    /// False when attached to a browser the user owns; `quit` then only detaches.
    owns_browser: bool,
}

impl WebDriverSession {
    pub fn builder() -> WebDriverBuilder {
        WebDriverBuilder::default()
    }

    /// Attach to a running Chrome started with `--remote-debugging-port`.
    pub fn attach(webdriver_url: &str, debugger_address: &str) -> Result<Self, DriverError> {
        Self::builder()
            .webdriver_url(webdriver_url)
            .debugger_address(debugger_address)
            .connect()
    }

    /// Launch a Chrome that silently prints every page to PDF into `output_dir`.
    pub fn launch_printer(webdriver_url: &str, output_dir: &Path) -> Result<Self, DriverError> {
        Self::builder()
            .webdriver_url(webdriver_url)
            .print_to(output_dir)
            .connect()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, DriverError> {
        let url = format!("{}/session/{}{}", self.base, self.session_id, path);
        send(&self.http, method, &url, body)
    }

    fn find(&self, path: &str, selector: &str) -> Result<Vec<Element>, DriverError> {
        let found = self.command(
            Method::POST,
            path,
            Some(json!({ "using": "css selector", "value": selector })),
        )?;
        let refs = found
            .as_array()
            .ok_or_else(|| DriverError::Malformed(format!("find returned {}", found)))?;
        let ids = refs
            .iter()
            .map(|r| {
                r.get(ELEMENT_KEY)
                    .and_then(Value::as_str)
                    .map(|s| ElementId(s.to_string()))
                    .ok_or_else(|| DriverError::Malformed(format!("element reference {}", r)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let args: Vec<Value> = ids.iter().map(element_ref).collect();
        let snapshots = self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": SNAPSHOT_SCRIPT, "args": [args] })),
        )?;
        let snapshots: Vec<RawSnapshot> = serde_json::from_value(snapshots)
            .map_err(|e| DriverError::Malformed(format!("element snapshot: {}", e)))?;
        Ok(ids
            .into_iter()
            .zip(snapshots)
            .map(|(id, s)| Element {
                id,
                attributes: s.attributes,
                text: s.text,
                enabled: s.enabled,
                displayed: s.displayed,
            })
            .collect())
    }
}

fn element_ref(id: &ElementId) -> Value {
    let mut m = Map::new();
    m.insert(ELEMENT_KEY.to_string(), Value::String(id.0.clone()));
    Value::Object(m)
}

/// Send one WebDriver command and unwrap the `value` member of the reply.
fn send(
    http: &reqwest::blocking::Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, DriverError> {
    let mut request = http.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().map_err(|e| {
        if e.is_timeout() {
            DriverError::Timeout {
                operation: url.to_string(),
                message: e.to_string(),
            }
        } else {
            DriverError::Transport {
                url: url.to_string(),
                source: e,
            }
        }
    })?;
    let status = response.status();
    let payload: Value = response
        .json()
        .map_err(|e| DriverError::Malformed(format!("{}: {}", url, e)))?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);
    if status.is_success() {
        Ok(value)
    } else {
        Err(classify_error(status.as_u16(), &value))
    }
}

/// Map a W3C error payload onto the driver error taxonomy.
fn classify_error(status: u16, value: &Value) -> DriverError {
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    match error.as_str() {
        "no such window" | "invalid session id" | "disconnected" => {
            DriverError::SessionLost { message }
        }
        "timeout" | "script timeout" => DriverError::Timeout {
            operation: "webdriver command".to_string(),
            message,
        },
        "no such element" | "stale element reference" => DriverError::NoSuchElement(message),
        "element not interactable" | "element click intercepted" => {
            DriverError::NotInteractable(message)
        }
        "javascript error" => DriverError::Script(message),
        _ => DriverError::Protocol {
            status,
            error,
            message,
        },
    }
}

/// Chrome print settings: save as PDF, A4, backgrounds on, no header/footer.
fn print_app_state() -> String {
    json!({
        "recentDestinations": [{ "id": "Save as PDF", "origin": "local", "account": "" }],
        "selectedDestinationId": "Save as PDF",
        "version": 2,
        "isHeaderFooterEnabled": false,
        "isCssBackgroundEnabled": true,
        "mediaSize": {
            "height_microns": 297000,
            "name": "ISO_A4",
            "width_microns": 210000,
            "custom_display_name": "A4"
        }
    })
    .to_string()
}

impl Driver for WebDriverSession {
    fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))?;
        Ok(())
    }

    fn query_elements(&mut self, selector: &str) -> Result<Vec<Element>, DriverError> {
        self.find("/elements", selector)
    }

    fn query_within(
        &mut self,
        parent: &Element,
        selector: &str,
    ) -> Result<Vec<Element>, DriverError> {
        self.find(&format!("/element/{}/elements", parent.id.0), selector)
    }

    /// Clicks through script; the feed's pager ignores some synthetic pointer events.
    fn click(&mut self, element: &Element) -> Result<(), DriverError> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": "arguments[0].click();", "args": [element_ref(&element.id)] })),
        )?;
        Ok(())
    }

    fn execute_script(&mut self, script: &str) -> Result<Value, DriverError> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": [] })),
        )
    }

    fn list_contexts(&mut self) -> Result<Vec<ContextId>, DriverError> {
        let handles = self.command(Method::GET, "/window/handles", None)?;
        let handles = handles
            .as_array()
            .ok_or_else(|| DriverError::Malformed(format!("window handles {}", handles)))?;
        Ok(handles
            .iter()
            .filter_map(Value::as_str)
            .map(|h| ContextId(h.to_string()))
            .collect())
    }

    fn current_context(&mut self) -> Result<ContextId, DriverError> {
        let handle = self.command(Method::GET, "/window", None)?;
        handle
            .as_str()
            .map(|h| ContextId(h.to_string()))
            .ok_or_else(|| DriverError::Malformed(format!("window handle {}", handle)))
    }

    fn open_context(&mut self, url: &str) -> Result<ContextId, DriverError> {
        let created = self.command(Method::POST, "/window/new", Some(json!({ "type": "tab" })))?;
        let handle = created
            .get("handle")
            .and_then(Value::as_str)
            .map(|h| ContextId(h.to_string()))
            .ok_or_else(|| DriverError::Malformed(format!("new window {}", created)))?;
        let opened = self
            .switch_to_context(&handle)
            .and_then(|_| self.navigate(url));
        if let Err(e) = opened {
            if let Err(close) = self.close_context(&handle) {
                tracing::debug!(context = %handle, error = %close, "Could not close half-opened window");
            }
            return Err(e);
        }
        Ok(handle)
    }

    fn close_context(&mut self, id: &ContextId) -> Result<(), DriverError> {
        if self.current_context().ok().as_ref() != Some(id) {
            self.switch_to_context(id)?;
        }
        self.command(Method::DELETE, "/window", None)?;
        Ok(())
    }

    fn switch_to_context(&mut self, id: &ContextId) -> Result<(), DriverError> {
        self.command(Method::POST, "/window", Some(json!({ "handle": id.0 })))?;
        Ok(())
    }

    fn quit(&mut self) -> Result<(), DriverError> {
        if !self.owns_browser {
            return Ok(());
        }
        self.command(Method::DELETE, "", None)?;
        Ok(())
    }
}

/// Builder for a chromedriver session.
#[derive(Debug)]
pub struct WebDriverBuilder {
    webdriver_url: String,
    timeout_secs: u64,
    debugger_address: Option<String>,
    args: Vec<String>,
    prefs: Map<String, Value>,
}

impl Default for WebDriverBuilder {
    fn default() -> Self {
        Self {
            webdriver_url: DEFAULT_WEBDRIVER_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            debugger_address: None,
            args: Vec::new(),
            prefs: Map::new(),
        }
    }
}

impl WebDriverBuilder {
    /// chromedriver endpoint. Default `http://127.0.0.1:9515`.
    pub fn webdriver_url(mut self, url: impl Into<String>) -> Self {
        self.webdriver_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Attach to an existing browser instead of launching one.
    pub fn debugger_address(mut self, address: impl Into<String>) -> Self {
        self.debugger_address = Some(address.into());
        self
    }

    /// Enable silent printing to PDF into `dir`.
    pub fn print_to(mut self, dir: &Path) -> Self {
        self.args.push("--enable-print-browser".to_string());
        self.args.push("--kiosk-printing".to_string());
        self.prefs.insert(
            "printing.print_preview_sticky_settings.appState".to_string(),
            Value::String(print_app_state()),
        );
        self.prefs.insert(
            "savefile.default_directory".to_string(),
            Value::String(dir.display().to_string()),
        );
        self
    }

    fn chrome_options(&self) -> Value {
        let mut options = Map::new();
        if let Some(address) = &self.debugger_address {
            options.insert("debuggerAddress".to_string(), Value::String(address.clone()));
        } else {
            options.insert("args".to_string(), json!(self.args));
            if !self.prefs.is_empty() {
                options.insert("prefs".to_string(), Value::Object(self.prefs.clone()));
            }
        }
        Value::Object(options)
    }

    /// Create the session.
    pub fn connect(self) -> Result<WebDriverSession, DriverError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| DriverError::Transport {
                url: self.webdriver_url.clone(),
                source: e,
            })?;
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": self.chrome_options()
                }
            }
        });
        let url = format!("{}/session", self.webdriver_url);
        let created = send(&http, Method::POST, &url, Some(capabilities))?;
        let session_id = created
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Malformed(format!("new session {}", created)))?
            .to_string();
        tracing::debug!(session = %session_id, attached = self.debugger_address.is_some(), "WebDriver session created");
        Ok(WebDriverSession {
            http,
            base: self.webdriver_url,
            session_id,
            owns_browser: self.debugger_address.is_none(),
        })
    }
}
