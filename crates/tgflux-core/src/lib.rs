pub mod analytics;
pub mod config;
pub mod db;
pub mod detector;
pub mod enrichment;
pub mod layout;
pub mod loader;
pub mod media_manifest;
pub mod orchestrator;
pub mod run_lock;
pub mod schedule;
pub mod scrape_log;
pub mod scraper;
pub mod sources;
pub mod transform;

pub use config::{DatabaseSettings, PipelineConfig, TelegramCredentials};
pub use db::DbPool;
pub use layout::DataLayout;
pub use orchestrator::{Orchestrator, RunOutcome, RunReceipt, Trigger};
