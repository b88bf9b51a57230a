use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tgflux_parser::{path_key, ChannelFileRecord, ChannelName, MediaManifestEntry};
use tokio::fs;
use tracing::{error, info, warn};

use crate::layout::DataLayout;
use crate::media_manifest;
use crate::scrape_log::ScrapeLog;
use crate::sources::{MessageSource, SourceMessage};

#[derive(Debug, Clone, Serialize)]
pub struct ChannelScrape {
    pub channel: String,
    pub messages: usize,
    pub images: usize,
    pub failed_downloads: usize,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeFailure {
    pub channel: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeReport {
    pub scraped: Vec<ChannelScrape>,
    pub failed: Vec<ScrapeFailure>,
}

impl ScrapeReport {
    pub fn total_messages(&self) -> usize {
        self.scraped.iter().map(|channel| channel.messages).sum()
    }
}

/// Scrapes each channel in turn. A failing channel is recorded and the
/// remaining channels still run.
pub async fn scrape_channels(
    source: &dyn MessageSource,
    layout: &DataLayout,
    channels: &[ChannelName],
    limit: usize,
) -> Result<ScrapeReport> {
    let log = ScrapeLog::new(layout.scrape_log_path());
    let mut report = ScrapeReport::default();

    for channel in channels {
        match scrape_channel(source, layout, channel, limit).await {
            Ok(scraped) => {
                info!(
                    channel = %channel,
                    messages = scraped.messages,
                    images = scraped.images,
                    path = %scraped.path,
                    "Scraped channel"
                );
                append_log(
                    &log,
                    &format!(
                        "Scraped {} messages from {} -> {}",
                        scraped.messages, channel, scraped.path
                    ),
                )
                .await;
                report.scraped.push(scraped);
            }
            Err(err) => {
                error!(channel = %channel, "Error scraping channel: {err:#}");
                append_log(&log, &format!("Error scraping {channel}: {err:#}")).await;
                report.failed.push(ScrapeFailure {
                    channel: channel.to_string(),
                    error: format!("{err:#}"),
                });
            }
        }
    }

    info!(
        channels = report.scraped.len(),
        failed = report.failed.len(),
        messages = report.total_messages(),
        "Scrape finished"
    );
    Ok(report)
}

async fn append_log(log: &ScrapeLog, message: &str) {
    if let Err(err) = log.append(message).await {
        warn!(path = %log.path().display(), "Failed to write scrape log: {err:#}");
    }
}

async fn scrape_channel(
    source: &dyn MessageSource,
    layout: &DataLayout,
    channel: &ChannelName,
    limit: usize,
) -> Result<ChannelScrape> {
    let messages = source
        .recent_messages(channel, limit)
        .await
        .with_context(|| format!("failed to fetch messages from {}", source.name()))?;

    let media_dir = layout.channel_media_dir(channel);
    let mut records = Vec::with_capacity(messages.len());
    let mut manifest_entries = Vec::new();
    let mut failed_downloads = 0;

    for message in messages {
        let image_path = if message.has_photo {
            match download(source, layout, channel, &message, &media_dir).await {
                Ok(path) => {
                    let image_path = path_key(&path);
                    manifest_entries.push(MediaManifestEntry {
                        image_path: image_path.clone(),
                        channel: channel.to_string(),
                        message_id: message.id,
                        scraped_at: Utc::now(),
                    });
                    Some(image_path)
                }
                Err(err) => {
                    warn!(channel = %channel, message_id = message.id, "Photo download failed: {err:#}");
                    failed_downloads += 1;
                    None
                }
            }
        } else {
            None
        };

        records.push(ChannelFileRecord {
            id: message.id,
            message: message.text,
            date: message.date,
            sender_id: message.sender_id,
            downloaded_image_path: image_path,
        });
    }

    media_manifest::append(&layout.manifest_path(), &manifest_entries).await?;

    let path = layout.channel_file(Utc::now().date_naive(), channel);
    write_channel_file(&path, &records).await?;

    Ok(ChannelScrape {
        channel: channel.to_string(),
        messages: records.len(),
        images: manifest_entries.len(),
        failed_downloads,
        path: path_key(&path),
    })
}

async fn download(
    source: &dyn MessageSource,
    layout: &DataLayout,
    channel: &ChannelName,
    message: &SourceMessage,
    media_dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(media_dir)
        .await
        .with_context(|| format!("failed to create {}", media_dir.display()))?;
    let path = layout.image_path(channel, message.id);
    source.download_photo(channel, message.id, &path).await?;
    Ok(path)
}

async fn write_channel_file(path: &Path, records: &[ChannelFileRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_string_pretty(records)?;
    fs::write(path, body)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}
