//! Telegram Desktop "Export chat history" JSON (`result.json`).

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::channel_file::parse_timestamp;
use crate::errors::ParserError;

#[derive(Debug, Clone, PartialEq)]
pub struct ExportedMessage {
    pub id: i64,
    pub text: Option<String>,
    pub date: DateTime<Utc>,
    pub sender_id: Option<i64>,
    /// Path of the exported photo, relative to the export directory.
    pub photo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DesktopExport {
    #[serde(default)]
    messages: Vec<ExportRecord>,
}

#[derive(Debug, Deserialize)]
struct ExportRecord {
    id: i64,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    date_unixtime: Option<String>,
    #[serde(default)]
    from_id: Option<String>,
    #[serde(default)]
    text: ExportText,
    #[serde(default)]
    photo: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExportText {
    Plain(String),
    Rich(Vec<ExportTextPart>),
}

impl Default for ExportText {
    fn default() -> Self {
        ExportText::Plain(String::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExportTextPart {
    Plain(String),
    Entity { text: String },
}

impl ExportText {
    fn flatten(self) -> String {
        match self {
            ExportText::Plain(text) => text,
            ExportText::Rich(parts) => parts
                .into_iter()
                .map(|part| match part {
                    ExportTextPart::Plain(text) => text,
                    ExportTextPart::Entity { text } => text,
                })
                .collect(),
        }
    }
}

/// Returns the regular messages of an export, newest first. Service messages
/// and messages without a usable date are dropped.
pub fn parse_desktop_export(content: &str) -> Result<Vec<ExportedMessage>, ParserError> {
    let export: DesktopExport =
        serde_json::from_str(content).map_err(|source| ParserError::InvalidExport { source })?;

    let mut messages: Vec<ExportedMessage> = export
        .messages
        .into_iter()
        .filter(|record| record.kind.is_empty() || record.kind == "message")
        .filter_map(|record| {
            let date = record
                .date_unixtime
                .as_deref()
                .and_then(|raw| raw.parse::<i64>().ok())
                .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
                .or_else(|| record.date.as_deref().and_then(parse_timestamp))?;
            let text = record.text.flatten();
            Some(ExportedMessage {
                id: record.id,
                text: (!text.is_empty()).then_some(text),
                date,
                sender_id: record.from_id.as_deref().and_then(peer_numeric_id),
                photo: record.photo.filter(|path| !path.starts_with('(')),
            })
        })
        .collect();

    messages.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(messages)
}

/// `from_id` is spelled `user123`, `channel456`, ...
fn peer_numeric_id(raw: &str) -> Option<i64> {
    raw.trim_start_matches(|ch: char| ch.is_ascii_alphabetic())
        .parse()
        .ok()
}
