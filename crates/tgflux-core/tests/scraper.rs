use std::path::Path;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tgflux_core::{
    layout::DataLayout,
    scraper::scrape_channels,
    sources::{MessageSource, SourceMessage},
};
use tgflux_parser::{parse_channel_file, parse_manifest, ChannelName};

struct FakeSource;

#[async_trait]
impl MessageSource for FakeSource {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn recent_messages(
        &self,
        channel: &ChannelName,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        if channel.as_str() == "tenamereja" {
            bail!("CHANNEL_PRIVATE");
        }
        let messages = (1..=5)
            .rev()
            .map(|id| SourceMessage {
                id,
                text: Some(format!("post {id}")),
                date: Utc.with_ymd_and_hms(2025, 3, 14, id as u32, 0, 0).unwrap(),
                sender_id: Some(-100),
                has_photo: id % 2 == 1,
            })
            .take(limit)
            .collect();
        Ok(messages)
    }

    async fn download_photo(
        &self,
        _channel: &ChannelName,
        message_id: i64,
        destination: &Path,
    ) -> Result<()> {
        if message_id == 3 {
            bail!("FILE_REFERENCE_EXPIRED");
        }
        std::fs::write(destination, b"\xff\xd8\xff")?;
        Ok(())
    }
}

fn channels(names: &[&str]) -> Vec<ChannelName> {
    names.iter().map(|name| ChannelName::new(*name).unwrap()).collect()
}

#[tokio::test]
async fn failing_channel_does_not_stop_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path().join("data"), dir.path().join("logs"));

    let report = scrape_channels(
        &FakeSource,
        &layout,
        &channels(&["tenamereja", "CheMed123"]),
        4,
    )
    .await
    .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].channel, "tenamereja");
    assert!(report.failed[0].error.contains("CHANNEL_PRIVATE"));
    assert_eq!(report.scraped.len(), 1);

    let scraped = &report.scraped[0];
    assert_eq!(scraped.messages, 4);
    assert_eq!(report.total_messages(), 4);
    // Messages 5, 3 and 1 carry photos; the limit drops 1 and 3 fails.
    assert_eq!(scraped.images, 1);
    assert_eq!(scraped.failed_downloads, 1);

    let file = layout.channel_file(Utc::now().date_naive(), &ChannelName::new("CheMed123").unwrap());
    let parsed = parse_channel_file("CheMed123", &std::fs::read_to_string(&file).unwrap()).unwrap();
    let ids: Vec<i64> = parsed.messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![5, 4, 3, 2]);
    assert!(parsed.messages[0].downloaded_image_path.as_deref().unwrap().ends_with("CheMed123/5.jpg"));
    assert!(parsed.messages[2].downloaded_image_path.is_none());

    let manifest = parse_manifest(&std::fs::read_to_string(layout.manifest_path()).unwrap());
    assert_eq!(manifest.len(), 1);
    let image = tgflux_parser::path_key(&layout.image_path(&ChannelName::new("CheMed123").unwrap(), 5));
    assert_eq!(manifest.lookup(&image).unwrap().message_id, 5);
    assert!(Path::new(&image).exists());

    let log = std::fs::read_to_string(layout.scrape_log_path()).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains(" - Error scraping tenamereja: "));
    assert!(lines[1].contains(" - Scraped 4 messages from CheMed123 -> "));
}

#[tokio::test]
async fn unwritable_scrape_log_does_not_stop_the_channels() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the log directory should be.
    let blocked = dir.path().join("logs");
    std::fs::write(&blocked, b"not a directory").unwrap();
    let layout = DataLayout::new(dir.path().join("data"), &blocked);

    let report = scrape_channels(
        &FakeSource,
        &layout,
        &channels(&["tenamereja", "CheMed123", "tikvahpharma"]),
        2,
    )
    .await
    .unwrap();

    assert_eq!(report.failed.len(), 1);
    let scraped: Vec<&str> = report.scraped.iter().map(|c| c.channel.as_str()).collect();
    assert_eq!(scraped, vec!["CheMed123", "tikvahpharma"]);
    assert!(!layout.scrape_log_path().exists());
}
