//! Optional config file loading. Search order: ./mparchive.toml, then
//! $XDG_CONFIG_HOME/mparchive/config.toml (or ~/.config/mparchive/config.toml).

use serde::Deserialize;
use std::path::PathBuf;

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Directory for exported PDFs. Paths are relative to CWD.
    pub output_dir: Option<PathBuf>,
    /// Directory for the dedup log, pending journal and batch manifests.
    pub state_dir: Option<PathBuf>,
    /// chromedriver endpoint (default http://127.0.0.1:9515).
    pub webdriver_url: Option<String>,
    /// DevTools address of the logged-in browser used for discovery (default 127.0.0.1:9222).
    pub debugger_address: Option<String>,
    /// Articles released before this date (YYYY-MM-DD) end discovery. Default 2020-01-01.
    pub cutoff_date: Option<String>,
    /// Random delay range between feed pages, [min, max] seconds. Any other length is rejected
    /// when settings are resolved.
    pub page_delay_secs: Option<Vec<u64>>,
    pub max_pages: Option<u32>,
    /// Text of the next-page control.
    pub next_page_label: Option<String>,
    /// Only links starting with this prefix are articles.
    pub article_prefix: Option<String>,
    /// Query parameters kept when normalizing article links.
    pub key_params: Option<Vec<String>>,
    /// Wait after opening an article, in seconds (default 10).
    pub settle_secs: Option<u64>,
    /// Wait after scrolling, in seconds (default 5).
    pub post_scroll_settle_secs: Option<u64>,
    pub scroll_step_px: Option<u32>,
    pub scroll_pause_ms: Option<u64>,
    pub max_scrolls: Option<u32>,
    /// How long to wait for a printed PDF to complete (default 60).
    pub render_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub stability_confirm_ms: Option<u64>,
    /// Attempts for transient driver failures (default 3).
    pub retry_count: Option<u32>,
    /// Delay in seconds before each retry (e.g. [1, 2]). The last value is reused.
    pub retry_backoff_secs: Option<Vec<u64>>,
    /// Account name recorded in batch manifests.
    pub account_name: Option<String>,
}

/// Search order: (1) ./mparchive.toml, (2) $XDG_CONFIG_HOME/mparchive/config.toml.
/// Missing file returns Ok(None). Invalid TOML or I/O error reading a present file returns Err.
pub fn load_config() -> Result<Option<Config>, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Cannot determine current directory: {}", e))?;
    let mut paths = vec![cwd.join("mparchive.toml")];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("mparchive").join("config.toml"));
    }
    for path in &paths {
        if path.exists() {
            let s = std::fs::read_to_string(path)
                .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
            let config: Config = toml::from_str(&s)
                .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
            tracing::debug!(path = %path.display(), "Config loaded");
            return Ok(Some(config));
        }
    }
    Ok(None)
}
