use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ParserError;
use crate::media::MediaKey;

/// One line of `manifest.jsonl`, written for every downloaded image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaManifestEntry {
    pub image_path: String,
    pub channel: String,
    pub message_id: i64,
    pub scraped_at: DateTime<Utc>,
}

impl MediaManifestEntry {
    pub fn key(&self) -> MediaKey {
        MediaKey {
            channel: self.channel.clone(),
            message_id: self.message_id,
        }
    }

    pub fn to_line(&self) -> Result<String, ParserError> {
        let mut line = serde_json::to_string(self).map_err(|source| ParserError::Serialize {
            what: "manifest entry",
            source,
        })?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestIssue {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct MediaManifest {
    entries: HashMap<String, MediaKey>,
    issues: Vec<ManifestIssue>,
}

impl MediaManifest {
    pub fn lookup(&self, image_path: &str) -> Option<&MediaKey> {
        self.entries.get(image_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn issues(&self) -> &[ManifestIssue] {
        &self.issues
    }
}

/// Reads a manifest. The file is append-only, so a path listed more than once
/// resolves to its latest line. Unreadable lines are collected as issues.
pub fn parse_manifest(content: &str) -> MediaManifest {
    let mut manifest = MediaManifest::default();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<MediaManifestEntry>(line) {
            Ok(entry) => {
                let key = entry.key();
                manifest.entries.insert(entry.image_path, key);
            }
            Err(err) => manifest.issues.push(ManifestIssue {
                line: index + 1,
                reason: err.to_string(),
            }),
        }
    }

    manifest
}
