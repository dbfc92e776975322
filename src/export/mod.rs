//! Export: print each discovered article to a PDF in the output directory.
//!
//! Jobs run one at a time on a dedicated printing engine. A job failure never stops the batch;
//! only losing the engine for good does.

pub mod artifact;
pub mod filename;
pub mod scroll;

#[cfg(test)]
pub(crate) mod testing;

pub use artifact::StabilityPoll;
pub use filename::{sanitize, target_name, unique_target};
pub use scroll::{scroll_to_bottom, ScrollSettings, ScrollStop};

use crate::driver::{ContextId, Driver, DriverError, EngineFactory};
use crate::model::{ExportJob, ItemRecord, JobStatus};
use crate::pacing::{CancelFlag, Clock};
use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const BLANK_PAGE: &str = "about:blank";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Artifact {path} was not complete after {waited:?}")]
    RenderTimeout { path: PathBuf, waited: Duration },

    #[error("Rendering session lost: {0}")]
    SessionLost(#[source] DriverError),

    #[error(transparent)]
    Driver(DriverError),

    /// The engine could not be started or recreated. Ends the export run.
    #[error("Rendering engine unavailable: {0}")]
    EngineUnavailable(#[source] DriverError),

    #[error("Cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<DriverError> for ExportError {
    fn from(e: DriverError) -> Self {
        if e.is_session_lost() {
            ExportError::SessionLost(e)
        } else {
            ExportError::Driver(e)
        }
    }
}

impl ExportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExportError::EngineUnavailable(_) | ExportError::OutputDir { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub output_dir: PathBuf,
    /// Wait after opening the article, before scrolling.
    pub settle: Duration,
    /// Wait after scrolling, before printing.
    pub post_scroll_settle: Duration,
    pub scroll: ScrollSettings,
    pub poll: StabilityPoll,
}

impl ExportSettings {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            settle: Duration::from_secs(10),
            post_scroll_settle: Duration::from_secs(5),
            scroll: ScrollSettings::default(),
            poll: StabilityPoll::default(),
        }
    }
}

/// Options for a batch: progress callback (done, total), a hook run after every attempted job,
/// and an interrupt checked between jobs.
#[derive(Default)]
pub struct ExportOptions<'a> {
    pub progress: Option<&'a dyn Fn(u32, u32)>,
    pub on_job_done: Option<&'a mut dyn FnMut(&ExportJob)>,
    pub cancel: Option<&'a CancelFlag>,
}

/// Outcome of a batch. Jobs never attempted (cancellation, fatal error) stay Pending.
#[derive(Debug)]
pub struct ExportReport {
    pub jobs: Vec<ExportJob>,
    pub cancelled: bool,
    pub fatal: Option<ExportError>,
}

impl ExportReport {
    fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status() == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(JobStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(JobStatus::Failed)
    }

    pub fn not_attempted(&self) -> usize {
        self.count(JobStatus::Pending)
    }
}

/// Script that names the print job and starts kiosk printing.
fn print_script(file_name: &str) -> String {
    let title = serde_json::Value::String(file_name.to_string());
    format!("document.title = {}; window.print();", title)
}

pub struct ExportWorker<'a> {
    engine: Option<Box<dyn Driver>>,
    factory: &'a mut dyn EngineFactory,
    settings: ExportSettings,
    retry: RetryPolicy,
    clock: &'a dyn Clock,
}

impl<'a> ExportWorker<'a> {
    /// The engine is launched through `factory` when the first job starts.
    pub fn new(
        factory: &'a mut dyn EngineFactory,
        settings: ExportSettings,
        retry: RetryPolicy,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            engine: None,
            factory,
            settings,
            retry,
            clock,
        }
    }

    /// Export `records` in order.
    pub fn export_batch(&mut self, records: Vec<ItemRecord>, options: &mut ExportOptions<'_>) -> ExportReport {
        let mut jobs: Vec<ExportJob> = records
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                let name = target_name(&r, i + 1);
                ExportJob::new(r, name)
            })
            .collect();
        let total = jobs.len() as u32;
        let mut report_cancelled = false;
        let mut fatal = None;

        if let Err(source) = std::fs::create_dir_all(&self.settings.output_dir) {
            fatal = Some(ExportError::OutputDir {
                path: self.settings.output_dir.clone(),
                source,
            });
        }

        for (i, job) in jobs.iter_mut().enumerate() {
            if fatal.is_some() {
                break;
            }
            if options.cancel.map(CancelFlag::is_cancelled).unwrap_or(false) {
                tracing::info!(remaining = total - i as u32, "Export cancelled");
                report_cancelled = true;
                break;
            }
            tracing::info!(
                job = i + 1,
                total,
                title = %job.record.title,
                "Exporting article"
            );
            match self.export_one(job) {
                Ok(path) => {
                    job.advance(JobStatus::Succeeded);
                    tracing::info!(path = %path.display(), "Article exported");
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Export run aborted");
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    job.advance(JobStatus::Failed);
                    tracing::warn!(title = %job.record.title, error = %e, "Article export failed");
                    if matches!(e, ExportError::SessionLost(_)) {
                        if let Err(fatal_err) = self.recover() {
                            tracing::error!(error = %fatal_err, "Export run aborted");
                            fatal = Some(fatal_err);
                        }
                    }
                }
            }
            if let Some(hook) = options.on_job_done.as_deref_mut() {
                hook(job);
            }
            if let Some(progress) = options.progress {
                progress(i as u32 + 1, total);
            }
        }

        if let Some(mut engine) = self.engine.take() {
            if let Err(e) = engine.quit() {
                tracing::debug!(error = %e, "Engine did not quit cleanly");
            }
        }
        ExportReport {
            jobs,
            cancelled: report_cancelled,
            fatal,
        }
    }

    fn engine(&mut self) -> Result<&mut dyn Driver, ExportError> {
        if self.engine.is_none() {
            tracing::info!("Starting rendering engine");
            let engine = self.factory.launch().map_err(ExportError::EngineUnavailable)?;
            self.engine = Some(engine);
        }
        match self.engine.as_mut() {
            Some(engine) => Ok(engine.as_mut()),
            None => Err(ExportError::EngineUnavailable(DriverError::SessionLost {
                message: "no engine".to_string(),
            })),
        }
    }

    /// Render one job. Every context the job opened, including ones left behind by failed
    /// open attempts, is released whatever the outcome.
    pub fn export_one(&mut self, job: &mut ExportJob) -> Result<PathBuf, ExportError> {
        let clock = self.clock;
        let retry = self.retry.clone();
        let link = job.record.link.clone();
        let engine = self.engine()?;
        let before = engine.list_contexts()?;
        job.advance(JobStatus::Rendering);
        let opened = retry.run(clock, "open article", || engine.open_context(&link));
        let result = match opened {
            Ok(_) => self.render(job),
            Err(e) => Err(e.into()),
        };
        self.release_contexts(&before);
        result
    }

    fn render(&mut self, job: &mut ExportJob) -> Result<PathBuf, ExportError> {
        let settings = self.settings.clone();
        let clock = self.clock;
        clock.sleep(settings.settle);
        let engine = self.engine()?;
        match scroll_to_bottom(engine, &settings.scroll, clock) {
            Ok(_) => {}
            Err(e) if e.is_session_lost() => return Err(e.into()),
            Err(e) => tracing::warn!(error = %e, "Scrolling failed; printing what is loaded"),
        }
        clock.sleep(settings.post_scroll_settle);

        job.target_name = unique_target(&settings.output_dir, &job.target_name);
        let path = settings.output_dir.join(&job.target_name);
        tracing::debug!(file = %job.target_name, "Printing");
        engine.execute_script(&print_script(&job.target_name))?;
        match settings.poll.wait(&path, clock) {
            Some(_) => Ok(path),
            None => Err(ExportError::RenderTimeout {
                path,
                waited: settings.poll.timeout,
            }),
        }
    }

    /// Close every context not in `before`, keeping at least one open: if none would remain, a
    /// blank one is opened first. Failures are logged; a lost session surfaces on the next job.
    fn release_contexts(&mut self, before: &[ContextId]) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let result = (|| -> Result<(), DriverError> {
            let open = engine.list_contexts()?;
            let (doomed, kept): (Vec<ContextId>, Vec<ContextId>) =
                open.into_iter().partition(|c| !before.contains(c));
            if doomed.is_empty() {
                if let Some(first) = kept.first() {
                    if engine.current_context().ok().as_ref() != Some(first) {
                        engine.switch_to_context(first)?;
                    }
                }
                return Ok(());
            }
            let blank = if kept.is_empty() {
                Some(engine.open_context(BLANK_PAGE)?)
            } else {
                None
            };
            for context in &doomed {
                engine.close_context(context)?;
            }
            if let Some(target) = blank.as_ref().or(kept.first()) {
                engine.switch_to_context(target)?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            tracing::debug!(error = %e, "Context cleanup failed");
        }
    }

    /// After a lost session: switch to any surviving context, else recreate the engine once.
    fn recover(&mut self) -> Result<(), ExportError> {
        if let Some(engine) = self.engine.as_mut() {
            if let Ok(open) = engine.list_contexts() {
                if let Some(first) = open.first() {
                    if engine.switch_to_context(first).is_ok() {
                        tracing::info!(context = %first, "Recovered by switching context");
                        return Ok(());
                    }
                }
            }
            if let Err(e) = engine.quit() {
                tracing::debug!(error = %e, "Lost engine did not quit cleanly");
            }
        }
        self.engine = None;
        tracing::warn!("No usable context left; recreating the rendering engine");
        let engine = self.factory.launch().map_err(ExportError::EngineUnavailable)?;
        self.engine = Some(engine);
        Ok(())
    }
}
