use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tgflux_parser::{parse_manifest, path_key, MediaManifest, MediaManifestEntry};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::enrichment::{discover_images, resolve_media_key};
use crate::layout::DataLayout;

/// Loads the manifest written by the scraper. A missing file is an empty
/// manifest.
pub async fn load(path: &Path) -> Result<MediaManifest> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(MediaManifest::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    let manifest = parse_manifest(&content);
    for issue in manifest.issues() {
        warn!(
            path = %path.display(),
            line = issue.line,
            reason = %issue.reason,
            "Ignoring unreadable media manifest line"
        );
    }
    Ok(manifest)
}

pub async fn append(path: &Path, entries: &[MediaManifestEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut buffer = String::new();
    for entry in entries {
        buffer.push_str(&entry.to_line()?);
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(buffer.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Replaces the manifest wholesale.
pub async fn rewrite(path: &Path, entries: &[MediaManifestEntry]) -> Result<()> {
    let mut buffer = String::new();
    for entry in entries {
        buffer.push_str(&entry.to_line()?);
    }
    fs::write(path, buffer)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    pub entries: usize,
    pub kept: usize,
    pub unresolved: Vec<String>,
}

/// Regenerates the manifest from the images on disk. Keys already in the
/// manifest are kept; other images are keyed by their path.
pub async fn rebuild(layout: &DataLayout, extensions: &[String]) -> Result<RebuildReport> {
    let path = layout.manifest_path();
    let existing = load(&path).await?;
    let mut report = RebuildReport::default();
    let mut entries = Vec::new();

    for image in discover_images(&layout.media_dir(), extensions)? {
        let image_path = path_key(&image);
        if existing.lookup(&image_path).is_some() {
            report.kept += 1;
        }
        match resolve_media_key(&image, &existing) {
            Ok(key) => entries.push(MediaManifestEntry {
                image_path,
                channel: key.channel,
                message_id: key.message_id,
                scraped_at: Utc::now(),
            }),
            Err(err) => {
                warn!(path = %image_path, "Image cannot be keyed, leaving it out of the manifest: {err}");
                report.unresolved.push(image_path);
            }
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    rewrite(&path, &entries).await?;
    report.entries = entries.len();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"img").unwrap();
    }

    #[tokio::test]
    async fn missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = load(&dir.path().join("manifest.jsonl")).await.unwrap();
        assert!(manifest.is_empty());
    }

    #[tokio::test]
    async fn appended_entries_are_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("media/manifest.jsonl");
        let entry = |id| MediaManifestEntry {
            image_path: format!("data/raw/telegram_media/CheMed123/{id}.jpg"),
            channel: "CheMed123".into(),
            message_id: id,
            scraped_at: Utc::now(),
        };

        append(&path, &[entry(1)]).await.unwrap();
        append(&path, &[entry(2), entry(3)]).await.unwrap();
        append(&path, &[]).await.unwrap();

        let manifest = load(&path).await.unwrap();
        assert_eq!(manifest.len(), 3);
        assert_eq!(
            manifest
                .lookup("data/raw/telegram_media/CheMed123/2.jpg")
                .unwrap()
                .message_id,
            2
        );
    }

    #[tokio::test]
    async fn rebuild_keeps_known_keys_and_parses_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path().join("data"), dir.path().join("logs"));
        let cover = layout.media_dir().join("legacy/cover.jpg");
        let positional = layout.media_dir().join("tenamereja/311.jpg");
        let orphan = layout.media_dir().join("tenamereja/banner.png");
        for path in [&cover, &positional, &orphan] {
            touch(path);
        }
        append(
            &layout.manifest_path(),
            &[MediaManifestEntry {
                image_path: path_key(&cover),
                channel: "lobelia4cosmetics".into(),
                message_id: 88,
                scraped_at: Utc::now(),
            }],
        )
        .await
        .unwrap();

        let extensions = vec!["jpg".to_string(), "png".to_string()];
        let report = rebuild(&layout, &extensions).await.unwrap();

        assert_eq!(report.entries, 2);
        assert_eq!(report.kept, 1);
        assert_eq!(report.unresolved, vec![path_key(&orphan)]);

        let manifest = load(&layout.manifest_path()).await.unwrap();
        assert_eq!(manifest.lookup(&path_key(&cover)).unwrap().message_id, 88);
        assert_eq!(manifest.lookup(&path_key(&positional)).unwrap().channel, "tenamereja");
    }
}
