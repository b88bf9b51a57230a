//! Where scraped messages come from.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tgflux_parser::ChannelName;

use crate::config::{PipelineConfig, ScrapeSource};

mod export;
#[cfg(feature = "telegram")]
pub mod telegram;

pub use export::DesktopExportSource;

#[derive(Debug, Clone, PartialEq)]
pub struct SourceMessage {
    pub id: i64,
    pub text: Option<String>,
    pub date: DateTime<Utc>,
    pub sender_id: Option<i64>,
    pub has_photo: bool,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Up to `limit` of the channel's most recent messages, newest first.
    async fn recent_messages(
        &self,
        channel: &ChannelName,
        limit: usize,
    ) -> Result<Vec<SourceMessage>>;

    /// Writes the photo attached to `message_id` to `destination`.
    async fn download_photo(
        &self,
        channel: &ChannelName,
        message_id: i64,
        destination: &Path,
    ) -> Result<()>;
}

/// Builds the source selected by `scrape.source`.
pub async fn connect_source(config: &PipelineConfig) -> Result<Box<dyn MessageSource>> {
    match config.scrape.source {
        ScrapeSource::Export => Ok(Box::new(DesktopExportSource::new(&config.scrape.export_dir))),
        ScrapeSource::Telegram => connect_telegram().await,
    }
}

#[cfg(feature = "telegram")]
async fn connect_telegram() -> Result<Box<dyn MessageSource>> {
    let credentials = crate::config::TelegramCredentials::from_env()?;
    let source = telegram::TelegramSource::connect(&credentials).await?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "telegram"))]
async fn connect_telegram() -> Result<Box<dyn MessageSource>> {
    anyhow::bail!(
        "scrape.source = \"telegram\" requires a build with the `telegram` feature; \
         rebuild with `--features telegram` or set scrape.source = \"export\""
    )
}
