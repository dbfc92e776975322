//! mparchive: collects new articles from a WeChat Official Account feed and prints them to PDF.

pub mod cli;
pub mod config;
pub mod crawl;
pub mod driver;
pub mod export;
pub mod journal;
pub mod manifest;
pub mod model;
pub mod pacing;
pub mod pipeline;
pub mod retry;
pub mod store;

// Re-exports for CLI and consumers.
pub use crawl::{CrawlOptions, CrawlSettings, DateGate, Discovery, PageCrawler, StopReason};
pub use driver::{Driver, DriverError, EngineFactory, SnapshotDriver, WebDriverSession};
pub use export::{ExportError, ExportOptions, ExportReport, ExportSettings, ExportWorker};
pub use journal::PendingJournal;
pub use model::{ExportJob, ItemRecord, JobStatus, LinkKey};
pub use pacing::{CancelFlag, Clock, SystemClock};
pub use pipeline::{Orchestrator, PipelineError, RunContext, RunSummary};
pub use retry::RetryPolicy;
pub use store::{FileStore, MemoryStore, Store, StoreError};
