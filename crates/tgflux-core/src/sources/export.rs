use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tgflux_parser::{parse_desktop_export, ChannelName};
use tokio::fs;

use super::{MessageSource, SourceMessage};

/// Serves messages from Telegram Desktop exports laid out as
/// `<root>/<channel>/result.json`, with photos relative to the channel
/// directory.
#[derive(Debug)]
pub struct DesktopExportSource {
    root: PathBuf,
    photos: Mutex<HashMap<(String, i64), PathBuf>>,
}

impl DesktopExportSource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            photos: Mutex::new(HashMap::new()),
        }
    }

    fn channel_dir(&self, channel: &ChannelName) -> PathBuf {
        self.root.join(channel.as_str())
    }
}

#[async_trait]
impl MessageSource for DesktopExportSource {
    fn name(&self) -> &'static str {
        "export"
    }

    async fn recent_messages(
        &self,
        channel: &ChannelName,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        let export_path = self.channel_dir(channel).join("result.json");
        let content = fs::read_to_string(&export_path)
            .await
            .with_context(|| format!("failed to read export {}", export_path.display()))?;
        let exported = parse_desktop_export(&content)
            .with_context(|| format!("failed to parse export {}", export_path.display()))?;

        let mut photos = self
            .photos
            .lock()
            .map_err(|_| anyhow!("export photo index poisoned"))?;
        let messages = exported
            .into_iter()
            .take(limit)
            .map(|message| {
                if let Some(photo) = &message.photo {
                    photos.insert(
                        (channel.as_str().to_string(), message.id),
                        self.channel_dir(channel).join(photo),
                    );
                }
                SourceMessage {
                    id: message.id,
                    has_photo: message.photo.is_some(),
                    text: message.text,
                    date: message.date,
                    sender_id: message.sender_id,
                }
            })
            .collect();
        Ok(messages)
    }

    async fn download_photo(
        &self,
        channel: &ChannelName,
        message_id: i64,
        destination: &Path,
    ) -> Result<()> {
        let photo = self
            .photos
            .lock()
            .map_err(|_| anyhow!("export photo index poisoned"))?
            .get(&(channel.as_str().to_string(), message_id))
            .cloned()
            .ok_or_else(|| anyhow!("message {message_id} in {channel} has no exported photo"))?;

        fs::copy(&photo, destination).await.with_context(|| {
            format!(
                "failed to copy {} to {}",
                photo.display(),
                destination.display()
            )
        })?;
        Ok(())
    }
}
