use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Append-only `logs/scraping.log`, one `<utc timestamp> - <message>` line per
/// channel outcome.
#[derive(Debug, Clone)]
pub struct ScrapeLog {
    path: PathBuf,
}

impl ScrapeLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let line = format!(
            "{} - {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f"),
            message
        );
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = ScrapeLog::new(dir.path().join("logs/scraping.log"));

        log.append("Scraped 3 messages from CheMed123 -> a.json").await.unwrap();
        log.append("Error scraping tenamereja: timeout").await.unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - Scraped 3 messages from CheMed123 -> a.json"));
        assert!(lines[1].ends_with(" - Error scraping tenamereja: timeout"));
        let (timestamp, _) = lines[0].split_once(" - ").unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f").is_ok());
    }
}
