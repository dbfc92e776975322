//! Two-phase run: discover the delta, then export it.
//!
//! Discovery finishes before export starts, and the two phases never share a rendering
//! context: discovery drives the user's logged-in browser, export a printing engine of its own.

use crate::crawl::{Discovery, PageCrawler, StopReason};
use crate::driver::{Driver, EngineFactory};
use crate::export::{ExportError, ExportOptions, ExportSettings, ExportWorker};
use crate::journal::PendingJournal;
use crate::manifest::BatchManifest;
use crate::model::{ExportJob, ItemRecord};
use crate::pacing::{CancelFlag, Clock};
use crate::retry::RetryPolicy;
use crate::store::{Store, StoreError};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Discovering,
    /// Discovery stopped at the date cutoff.
    GatedStop,
    Exporting,
    Done,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Export aborted after {succeeded} succeeded and {failed} failed: {source}")]
    ExportAborted {
        succeeded: usize,
        failed: usize,
        #[source]
        source: ExportError,
    },
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// New articles found by this run's discovery.
    pub discovered: usize,
    /// Articles left over from an interrupted run and exported ahead of the delta.
    pub carried_over: usize,
    pub pages_visited: u32,
    pub stop: StopReason,
    pub succeeded: usize,
    pub failed: usize,
    /// Jobs not attempted because the run was cancelled or export was skipped.
    pub skipped: usize,
    pub manifest: Option<PathBuf>,
}

/// Where a run reads and records its state.
pub struct RunContext<'a> {
    pub store: &'a mut dyn Store,
    pub journal: Option<&'a mut PendingJournal>,
    /// Articles still pending from an earlier run.
    pub carry_over: Vec<ItemRecord>,
    pub progress: Option<&'a dyn Fn(u32, u32)>,
}

pub struct Orchestrator<'a> {
    crawler: PageCrawler<'a>,
    export: ExportSettings,
    retry: RetryPolicy,
    clock: &'a dyn Clock,
    account_name: String,
    manifest_dir: Option<PathBuf>,
    discover_only: bool,
    cancel: Option<CancelFlag>,
    state: RunState,
}

impl<'a> Orchestrator<'a> {
    pub fn new(crawler: PageCrawler<'a>, export: ExportSettings, retry: RetryPolicy, clock: &'a dyn Clock) -> Self {
        Self {
            crawler,
            export,
            retry,
            clock,
            account_name: String::new(),
            manifest_dir: None,
            discover_only: false,
            cancel: None,
            state: RunState::Discovering,
        }
    }

    /// Write a batch manifest for each run's delta into `dir`.
    pub fn manifest_dir(mut self, dir: PathBuf, account_name: &str) -> Self {
        self.manifest_dir = Some(dir);
        self.account_name = account_name.to_string();
        self
    }

    /// Stop after discovery; new articles stay pending for the next run.
    pub fn discover_only(mut self, yes: bool) -> Self {
        self.discover_only = yes;
        self
    }

    /// Interrupt checked between pages and between jobs. Only embedders set it; the CLI does not.
    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(from = ?self.state, to = ?next, "Run state");
        self.state = next;
    }

    pub fn run(
        &mut self,
        discovery_driver: &mut dyn Driver,
        factory: &mut dyn EngineFactory,
        ctx: RunContext<'_>,
    ) -> Result<RunSummary, PipelineError> {
        let RunContext {
            store,
            mut journal,
            carry_over,
            progress,
        } = ctx;
        self.transition(RunState::Discovering);

        let discovery = self.discover(discovery_driver, store, journal.as_deref_mut());
        tracing::info!(
            pages = discovery.pages_visited,
            new = discovery.items.len(),
            stop = ?discovery.stop,
            "Discovery finished"
        );
        let manifest = self.write_manifest(&discovery.items);

        let mut summary = RunSummary {
            discovered: discovery.items.len(),
            carried_over: carry_over.len(),
            pages_visited: discovery.pages_visited,
            stop: discovery.stop.clone(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            manifest,
        };
        let batch = merge_batch(carry_over, discovery.items);

        match discovery.stop {
            StopReason::Cutoff { .. } => self.transition(RunState::GatedStop),
            StopReason::Cancelled => {
                summary.skipped = batch.len();
                self.transition(RunState::Done);
                return Ok(summary);
            }
            _ => {}
        }
        if self.discover_only || batch.is_empty() {
            summary.skipped = batch.len();
            self.transition(RunState::Done);
            return Ok(summary);
        }

        self.transition(RunState::Exporting);
        let report = {
            let mut mark_done = |job: &ExportJob| {
                if let Some(j) = journal.as_deref_mut() {
                    if let Err(e) = j.mark_done(&job.record.key) {
                        tracing::warn!(error = %e, "Cannot mark article as exported");
                    }
                }
            };
            let mut options = ExportOptions {
                progress,
                on_job_done: Some(&mut mark_done),
                cancel: self.cancel.as_ref(),
            };
            let mut worker = ExportWorker::new(factory, self.export.clone(), self.retry.clone(), self.clock);
            worker.export_batch(batch, &mut options)
        };
        summary.succeeded = report.succeeded();
        summary.failed = report.failed();
        summary.skipped = report.not_attempted();

        if let Some(j) = journal.as_deref_mut() {
            match j.compact() {
                Ok(remaining) if remaining > 0 => {
                    tracing::info!(remaining, "Articles left for the next run")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Cannot compact pending journal"),
            }
        }
        self.transition(RunState::Done);
        tracing::info!(
            discovered = summary.discovered,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Run finished"
        );
        match report.fatal {
            Some(source) => Err(PipelineError::ExportAborted {
                succeeded: summary.succeeded,
                failed: summary.failed,
                source,
            }),
            None => Ok(summary),
        }
    }

    fn discover(
        &self,
        driver: &mut dyn Driver,
        store: &mut dyn Store,
        mut journal: Option<&mut PendingJournal>,
    ) -> Discovery {
        let mut record = |r: &ItemRecord| -> Result<(), StoreError> {
            match journal.as_deref_mut() {
                Some(j) => j.record_pending(r),
                None => Ok(()),
            }
        };
        let mut options = crate::crawl::CrawlOptions {
            on_new_item: Some(&mut record),
            cancel: self.cancel.as_ref(),
        };
        self.crawler.crawl(driver, store, &mut options)
    }

    fn write_manifest(&self, items: &[ItemRecord]) -> Option<PathBuf> {
        let dir = self.manifest_dir.as_ref()?;
        if items.is_empty() {
            return None;
        }
        match BatchManifest::new(&self.account_name, items).write_to(dir) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Cannot write batch manifest");
                None
            }
        }
    }
}

/// Carry-over first, then the delta; each key once.
fn merge_batch(carry_over: Vec<ItemRecord>, delta: Vec<ItemRecord>) -> Vec<ItemRecord> {
    let mut seen = HashSet::new();
    carry_over
        .into_iter()
        .chain(delta)
        .filter(|r| seen.insert(r.key.clone()))
        .collect()
}
