use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::errors::ParserError;
use crate::model::{ChannelName, RawMessage};

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const OFFSET_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];
const SENDER_KEYS: &[&str] = &["user_id", "channel_id", "chat_id"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIssue {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ParsedChannelFile {
    pub channel: String,
    pub messages: Vec<RawMessage>,
    pub skipped: Vec<RecordIssue>,
    /// Records that were kept with a field dropped, such as an unreadable date.
    pub warnings: Vec<RecordIssue>,
}

/// Decodes the contents of one `<channel>.json` file.
///
/// File-level problems (empty payload, invalid JSON, a payload that is not an
/// array) are errors. A record without a usable id is dropped and reported in
/// [`ParsedChannelFile::skipped`]. A record whose date cannot be read is kept
/// with no date and reported in [`ParsedChannelFile::warnings`].
pub fn parse_channel_file(channel: &str, content: &str) -> Result<ParsedChannelFile, ParserError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ParserError::EmptyFile);
    }

    let payload: Value =
        serde_json::from_str(trimmed).map_err(|source| ParserError::InvalidJson { source })?;

    let Value::Array(records) = payload else {
        return Err(ParserError::NotAnArray {
            found: json_kind(&payload),
        });
    };

    let mut messages = Vec::with_capacity(records.len());
    let mut skipped = Vec::new();
    let mut warnings = Vec::new();

    for (index, record) in records.iter().enumerate() {
        match decode_record(channel, record) {
            Ok((message, warning)) => {
                messages.push(message);
                if let Some(reason) = warning {
                    warnings.push(RecordIssue { index, reason });
                }
            }
            Err(reason) => skipped.push(RecordIssue { index, reason }),
        }
    }

    Ok(ParsedChannelFile {
        channel: channel.to_string(),
        messages,
        skipped,
        warnings,
    })
}

fn decode_record(channel: &str, record: &Value) -> Result<(RawMessage, Option<String>), String> {
    let Value::Object(fields) = record else {
        return Err(format!("record is a JSON {}, not an object", json_kind(record)));
    };

    let id = match fields.get("id") {
        Some(Value::Number(number)) => number
            .as_i64()
            .ok_or_else(|| format!("id {number} is not an integer"))?,
        Some(other) => return Err(format!("id is a JSON {}", json_kind(other))),
        None => return Err("record has no id".to_string()),
    };

    let message = match fields.get("message") {
        Some(Value::String(text)) => Some(text.clone()),
        _ => None,
    };

    let (date, warning) = match decode_date(fields.get("date")) {
        Ok(date) => (date, None),
        Err(reason) => (None, Some(reason)),
    };

    let message = RawMessage {
        channel: channel.to_string(),
        id,
        message,
        date,
        sender_id: decode_sender(fields),
        downloaded_image_path: match fields.get("downloaded_image_path") {
            Some(Value::String(path)) if !path.is_empty() => Some(path.clone()),
            _ => None,
        },
    };
    Ok((message, warning))
}

fn decode_date(value: Option<&Value>) -> Result<Option<DateTime<Utc>>, String> {
    match value {
        Some(Value::String(raw)) => parse_timestamp(raw)
            .map(Some)
            .ok_or_else(|| format!("unrecognised date '{raw}'")),
        Some(Value::Number(number)) => {
            let seconds = number
                .as_i64()
                .ok_or_else(|| format!("date {number} is not a unix timestamp"))?;
            Utc.timestamp_opt(seconds, 0)
                .single()
                .map(Some)
                .ok_or_else(|| format!("date {seconds} is out of range"))
        }
        _ => Ok(None),
    }
}

/// `sender_id` is either a scalar or a peer object such as
/// `{"_": "PeerUser", "user_id": 42}`.
fn decode_sender(fields: &Map<String, Value>) -> Option<i64> {
    match fields.get("sender_id")? {
        Value::Number(number) => number.as_i64(),
        Value::String(raw) => raw.trim().parse().ok(),
        Value::Object(peer) => SENDER_KEYS
            .iter()
            .find_map(|key| peer.get(*key).and_then(Value::as_i64)),
        _ => None,
    }
}

/// Parses the timestamp spellings found in channel files. Timestamps without
/// an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in OFFSET_TIMESTAMP_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// `https://t.me/CheMed123`, `t.me/CheMed123/`, `@CheMed123` and `CheMed123`
/// all name the channel `CheMed123`.
pub fn channel_name_from_identifier(identifier: &str) -> Result<ChannelName, ParserError> {
    let candidate = identifier
        .trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim_start_matches('@');

    ChannelName::new(candidate).map_err(|reason| ParserError::InvalidChannel {
        identifier: identifier.to_string(),
        reason,
    })
}

/// The channel a message file belongs to is its file stem.
pub fn channel_name_from_file(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
