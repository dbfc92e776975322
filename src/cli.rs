//! CLI parsing and orchestration. Resolves settings from flags, config and defaults, opens the
//! persistent state, runs discovery then export, and maps errors to exit codes.

use crate::config::{self, Config};
use crate::crawl::{
    parse_release_date, CrawlSettings, DateGate, ExtractRules, PageCrawler, StopReason,
    DEFAULT_ARTICLE_PREFIX, DEFAULT_NEXT_PAGE_LABEL,
};
use crate::driver::{Driver, DriverError, SnapshotDriver, WebDriverSession};
use crate::export::{ExportSettings, ScrollSettings, StabilityPoll};
use crate::journal::PendingJournal;
use crate::model::DEFAULT_KEY_PARAMS;
use crate::pacing::{PageDelay, SystemClock};
use crate::pipeline::{Orchestrator, PipelineError, RunContext, RunSummary};
use crate::retry::RetryPolicy;
use crate::store::{FileStore, Store, StoreError};
use chrono::NaiveDate;
use clap::Parser;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_WEBDRIVER_URL: &str = "http://127.0.0.1:9515";
const DEFAULT_DEBUGGER_ADDRESS: &str = "127.0.0.1:9222";
const DEFAULT_OUTPUT_DIR: &str = "pdf_articles";
const DEFAULT_STATE_DIR: &str = "mparchive_state";
const DEDUP_LOG: &str = "seen_links.log";
const JOURNAL: &str = "pending.jsonl";

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Driver(#[from] DriverError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) => 1,
            CliRunError::Driver(_) => 2,
            CliRunError::Store(_) | CliRunError::Pipeline(_) => 3,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "mparchive")]
#[command(about = "Collect new WeChat Official Account articles and print them to PDF")]
#[command(
    after_help = "Discovery runs on the feed page already open in a logged-in Chrome started with --remote-debugging-port. Config is read from ./mparchive.toml, else <config dir>/mparchive/config.toml (e.g. ~/.config/mparchive/config.toml). CLI flags override config."
)]
pub struct Args {
    /// chromedriver endpoint (overrides config; default http://127.0.0.1:9515).
    #[arg(long)]
    pub webdriver: Option<String>,

    /// DevTools address of the logged-in browser (overrides config; default 127.0.0.1:9222).
    #[arg(long)]
    pub debugger_address: Option<String>,

    /// Directory for exported PDFs (overrides config; default ./pdf_articles).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory for the dedup log, pending journal and batch manifests.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Stop discovery at the first article released before this date (YYYY-MM-DD).
    #[arg(long, value_parser = parse_cutoff)]
    pub cutoff: Option<NaiveDate>,

    /// Account name recorded in the batch manifest.
    #[arg(long)]
    pub account: Option<String>,

    /// Visit at most this many feed pages.
    #[arg(long)]
    pub max_pages: Option<u32>,

    /// Record new articles without exporting them; the next run exports them.
    #[arg(long)]
    pub discover_only: bool,

    /// Discover from saved feed pages (*.html, in file name order) instead of a live browser.
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Suppress progress output (errors only).
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Debug logging and the full error chain.
    #[arg(long)]
    pub verbose: bool,
}

fn parse_cutoff(s: &str) -> Result<NaiveDate, String> {
    parse_release_date(s)
        .map(|dt| dt.date())
        .map_err(|_| format!("Invalid --cutoff: expected YYYY-MM-DD, got '{}'", s))
}

/// Settings after applying flags over config over defaults.
#[derive(Debug)]
struct Resolved {
    webdriver_url: String,
    debugger_address: String,
    output_dir: PathBuf,
    state_dir: PathBuf,
    cutoff: NaiveDate,
    account_name: String,
    crawl: CrawlSettings,
    export: ExportSettings,
    retry: RetryPolicy,
}

fn resolve(args: &Args, config: Option<&Config>) -> Result<Resolved, CliRunError> {
    let cfg = |f: fn(&Config) -> Option<u64>| config.and_then(f);

    let cutoff = match args.cutoff {
        Some(d) => d,
        None => match config.and_then(|c| c.cutoff_date.as_deref()) {
            Some(s) => parse_cutoff(s).map_err(CliRunError::InvalidInput)?,
            None => DateGate::default().cutoff(),
        },
    };
    let output_dir = args
        .output
        .clone()
        .or_else(|| config.and_then(|c| c.output_dir.clone()))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    let state_dir = args
        .state_dir
        .clone()
        .or_else(|| config.and_then(|c| c.state_dir.clone()))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));

    let page_delay = match config.and_then(|c| c.page_delay_secs.as_deref()) {
        None => PageDelay::default(),
        Some(&[min, max]) => PageDelay::from_secs(min, max),
        Some(other) => {
            return Err(CliRunError::InvalidInput(format!(
                "Invalid config: page_delay_secs must be [min, max], got {:?}",
                other
            )))
        }
    };
    let crawl = CrawlSettings {
        rules: ExtractRules {
            article_prefix: config
                .and_then(|c| c.article_prefix.clone())
                .unwrap_or_else(|| DEFAULT_ARTICLE_PREFIX.to_string()),
            key_params: config
                .and_then(|c| c.key_params.clone())
                .unwrap_or_else(|| DEFAULT_KEY_PARAMS.iter().map(|s| s.to_string()).collect()),
        },
        next_page_label: config
            .and_then(|c| c.next_page_label.clone())
            .unwrap_or_else(|| DEFAULT_NEXT_PAGE_LABEL.to_string()),
        page_delay,
        max_pages: args.max_pages.or_else(|| config.and_then(|c| c.max_pages)),
    };
    if crawl.rules.key_params.is_empty() {
        return Err(CliRunError::InvalidInput(
            "Invalid config: key_params must name at least one query parameter".to_string(),
        ));
    }

    let scroll_defaults = ScrollSettings::default();
    let poll_defaults = StabilityPoll::default();
    let mut export = ExportSettings::new(output_dir.clone());
    if let Some(s) = cfg(|c| c.settle_secs) {
        export.settle = Duration::from_secs(s);
    }
    if let Some(s) = cfg(|c| c.post_scroll_settle_secs) {
        export.post_scroll_settle = Duration::from_secs(s);
    }
    export.scroll = ScrollSettings {
        step_px: config
            .and_then(|c| c.scroll_step_px)
            .unwrap_or(scroll_defaults.step_px),
        pause: cfg(|c| c.scroll_pause_ms)
            .map(Duration::from_millis)
            .unwrap_or(scroll_defaults.pause),
        max_scrolls: config
            .and_then(|c| c.max_scrolls)
            .unwrap_or(scroll_defaults.max_scrolls),
        tolerance_px: scroll_defaults.tolerance_px,
    };
    export.poll = StabilityPoll {
        timeout: cfg(|c| c.render_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(poll_defaults.timeout),
        interval: cfg(|c| c.poll_interval_ms)
            .map(Duration::from_millis)
            .unwrap_or(poll_defaults.interval),
        confirm: cfg(|c| c.stability_confirm_ms)
            .map(Duration::from_millis)
            .unwrap_or(poll_defaults.confirm),
    };

    let retry = match (
        config.and_then(|c| c.retry_count),
        config.and_then(|c| c.retry_backoff_secs.clone()),
    ) {
        (None, None) => RetryPolicy::default(),
        (count, backoff) => {
            let backoff: Vec<Duration> = backoff
                .unwrap_or_default()
                .into_iter()
                .map(Duration::from_secs)
                .collect();
            let count = count.unwrap_or(backoff.len() as u32 + 1);
            RetryPolicy::new(count, backoff)
        }
    };

    Ok(Resolved {
        webdriver_url: args
            .webdriver
            .clone()
            .or_else(|| config.and_then(|c| c.webdriver_url.clone()))
            .unwrap_or_else(|| DEFAULT_WEBDRIVER_URL.to_string()),
        debugger_address: args
            .debugger_address
            .clone()
            .or_else(|| config.and_then(|c| c.debugger_address.clone()))
            .unwrap_or_else(|| DEFAULT_DEBUGGER_ADDRESS.to_string()),
        output_dir,
        state_dir,
        cutoff,
        account_name: args
            .account
            .clone()
            .or_else(|| config.and_then(|c| c.account_name.clone()))
            .unwrap_or_default(),
        crawl,
        export,
        retry,
    })
}

/// Create `dir` if needed and return its absolute path (the printer needs one).
fn prepare_dir(dir: &Path, what: &str) -> Result<PathBuf, CliRunError> {
    std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::canonicalize(dir))
        .map_err(|e| CliRunError::InvalidInput(format!("Cannot use {} {}: {}", what, dir.display(), e)))
}

fn describe_stop(stop: &StopReason) -> String {
    match stop {
        StopReason::EndOfFeed => "end of feed".to_string(),
        StopReason::Cutoff {
            title,
            release_date,
        } => format!("reached \"{}\" ({}), older than the cutoff", title, release_date),
        StopReason::PageLimit => "page limit".to_string(),
        StopReason::Cancelled => "cancelled".to_string(),
        StopReason::Aborted(reason) => format!("aborted: {}", reason),
    }
}

fn print_summary(summary: &RunSummary) {
    eprintln!(
        "Discovery: {} new article(s) on {} page(s); stopped at {}",
        summary.discovered,
        summary.pages_visited,
        describe_stop(&summary.stop)
    );
    if summary.carried_over > 0 {
        eprintln!("Carried over from an earlier run: {}", summary.carried_over);
    }
    eprintln!(
        "Export: {} succeeded, {} failed, {} pending",
        summary.succeeded, summary.failed, summary.skipped
    );
    if let Some(path) = &summary.manifest {
        eprintln!("Manifest: {}", path.display());
    }
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code and message on failure.
pub fn run(args: &Args) -> Result<(), CliRunError> {
    let config = config::load_config().map_err(CliRunError::InvalidInput)?;
    run_with_config(args, config)
}

/// Run with an already loaded config (None: built-in defaults only).
pub fn run_with_config(args: &Args, config: Option<Config>) -> Result<(), CliRunError> {
    let settings = resolve(args, config.as_ref())?;
    let output_dir = prepare_dir(&settings.output_dir, "output directory")?;
    let state_dir = prepare_dir(&settings.state_dir, "state directory")?;
    tracing::info!(
        output = %output_dir.display(),
        state = %state_dir.display(),
        cutoff = %settings.cutoff,
        "Starting"
    );

    let mut store = FileStore::open(&state_dir.join(DEDUP_LOG))?;
    let (mut journal, carry_over) = PendingJournal::open(&state_dir.join(JOURNAL))?;
    tracing::info!(
        log = %store.path().display(),
        journal = %journal.path().display(),
        known = store.len(),
        pending = carry_over.len(),
        "State loaded"
    );

    let mut discovery_driver: Box<dyn Driver> = match &args.replay {
        Some(dir) => Box::new(SnapshotDriver::from_dir(dir).map_err(|e| {
            CliRunError::InvalidInput(format!("Cannot read replay pages in {}: {}", dir.display(), e))
        })?),
        None => {
            tracing::info!(address = %settings.debugger_address, "Attaching to the logged-in browser");
            let session =
                WebDriverSession::attach(&settings.webdriver_url, &settings.debugger_address)?;
            tracing::debug!(session = session.session_id(), "Discovery session ready");
            Box::new(session)
        }
    };

    let webdriver_url = settings.webdriver_url.clone();
    let printer_dir = output_dir.clone();
    let mut factory = move || -> Result<Box<dyn Driver>, DriverError> {
        let session = WebDriverSession::launch_printer(&webdriver_url, &printer_dir)?;
        Ok(Box::new(session))
    };

    let progress_state: RefCell<Option<indicatif::ProgressBar>> = RefCell::new(None);
    let progress_cb = |n: u32, total: u32| {
        if total == 0 {
            return;
        }
        let mut state = progress_state.borrow_mut();
        let pb = state.get_or_insert_with(|| {
            let bar = indicatif::ProgressBar::new(total as u64);
            bar.set_style(
                indicatif::ProgressStyle::default_bar()
                    .template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
                    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
                    .progress_chars("█▉▊▋▌▍▎▏ "),
            );
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });
        pb.set_position(n as u64);
        pb.set_message(format!("Exported {}/{}", n, total));
    };
    let progress: Option<&dyn Fn(u32, u32)> = if args.quiet { None } else { Some(&progress_cb) };

    let clock = SystemClock;
    let crawler = PageCrawler::new(
        settings.crawl.clone(),
        DateGate::new(settings.cutoff),
        settings.retry.clone(),
        &clock,
    );
    let mut export = settings.export.clone();
    export.output_dir = output_dir;
    let mut orchestrator = Orchestrator::new(crawler, export, settings.retry.clone(), &clock)
        .manifest_dir(state_dir, &settings.account_name)
        .discover_only(args.discover_only);

    let result = orchestrator.run(
        discovery_driver.as_mut(),
        &mut factory,
        RunContext {
            store: &mut store,
            journal: Some(&mut journal),
            carry_over,
            progress,
        },
    );

    if let Some(pb) = progress_state.borrow_mut().take() {
        pb.disable_steady_tick();
        pb.finish_and_clear();
    }

    let summary = result?;
    if !args.quiet {
        print_summary(&summary);
    }
    if let StopReason::Aborted(reason) = &summary.stop {
        tracing::warn!(%reason, "Discovery ended early; rerun to continue from the recorded state");
    }
    Ok(())
}
