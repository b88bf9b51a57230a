use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tgflux_parser::{media_file_name, ChannelName};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// On-disk layout shared by the scraper, the raw loader and enrichment.
///
/// ```text
/// <data_root>/raw/telegram_messages/<YYYY-MM-DD>/<channel>.json
/// <data_root>/raw/telegram_media/<channel>/<message_id>.jpg
/// <data_root>/raw/telegram_media/manifest.jsonl
/// <log_dir>/scraping.log
/// ```
#[derive(Debug, Clone)]
pub struct DataLayout {
    data_root: PathBuf,
    log_dir: PathBuf,
}

impl DataLayout {
    pub fn new(data_root: impl AsRef<Path>, log_dir: impl AsRef<Path>) -> Self {
        Self {
            data_root: data_root.as_ref().to_path_buf(),
            log_dir: log_dir.as_ref().to_path_buf(),
        }
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.data_root.join("raw").join("telegram_messages")
    }

    pub fn messages_dir_for(&self, date: NaiveDate) -> PathBuf {
        self.messages_dir().join(date.format(DATE_FORMAT).to_string())
    }

    pub fn channel_file(&self, date: NaiveDate, channel: &ChannelName) -> PathBuf {
        self.messages_dir_for(date)
            .join(format!("{}.json", channel.as_str()))
    }

    pub fn media_dir(&self) -> PathBuf {
        self.data_root.join("raw").join("telegram_media")
    }

    pub fn channel_media_dir(&self, channel: &ChannelName) -> PathBuf {
        self.media_dir().join(channel.as_str())
    }

    pub fn image_path(&self, channel: &ChannelName, message_id: i64) -> PathBuf {
        self.channel_media_dir(channel)
            .join(media_file_name(message_id))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.media_dir().join("manifest.jsonl")
    }

    pub fn scrape_log_path(&self) -> PathBuf {
        self.log_dir.join("scraping.log")
    }
}
