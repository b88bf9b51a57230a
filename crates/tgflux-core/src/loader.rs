use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blake3::Hasher;
use serde::Serialize;
use sqlx::{Postgres, QueryBuilder, Row};
use tgflux_parser::{channel_name_from_file, parse_channel_file, ParserError, RawMessage};
use tracing::{error, info, warn};

use crate::db::{self, DbPool};
use crate::layout::DataLayout;

/// Six binds per row keeps each statement well under the Postgres limit.
const INSERT_CHUNK_ROWS: usize = 5_000;

#[derive(Debug)]
pub struct ChannelFileInput<'a> {
    pub path: &'a str,
    pub contents: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Parsed,
    Duplicate,
    Empty,
    Malformed,
    Unreadable,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: String,
    pub channel: Option<String>,
    pub hash: Option<String>,
    pub status: FileStatus,
    pub records: usize,
    pub skipped_records: usize,
    pub undated_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct LoadedFile {
    pub hash: String,
    pub path: String,
    pub channel: String,
    pub record_count: usize,
}

#[derive(Debug, Default)]
pub struct LoadBatch {
    pub messages: Vec<RawMessage>,
    pub reports: Vec<FileReport>,
    pub new_files: Vec<LoadedFile>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub files: Vec<FileReport>,
    pub records: usize,
    pub inserted: u64,
    pub duplicates: u64,
}

impl LoadReport {
    pub fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|file| file.status == status).count()
    }
}

/// Content hash of a channel file. The channel is part of the hash so two
/// channels with byte-identical files are both loaded.
pub fn compute_hash(channel: &str, contents: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(channel.as_bytes());
    hasher.update(b"\0");
    hasher.update(contents);
    hasher.finalize().to_hex().to_string()
}

/// Parses a set of channel files without touching the database. Files whose
/// hash is already in `existing_hashes` (or repeated within the batch) are
/// reported as duplicates.
pub fn ingest_channel_files(
    inputs: &[ChannelFileInput<'_>],
    existing_hashes: &HashSet<String>,
) -> LoadBatch {
    let mut batch = LoadBatch::default();
    let mut seen = HashSet::new();

    for input in inputs {
        let report = |channel: Option<&str>, hash: Option<&str>, status, error: Option<String>| {
            FileReport {
                path: input.path.to_string(),
                channel: channel.map(str::to_string),
                hash: hash.map(str::to_string),
                status,
                records: 0,
                skipped_records: 0,
                undated_records: 0,
                error,
            }
        };

        let Some(channel) = channel_name_from_file(Path::new(input.path)) else {
            error!(path = input.path, "Channel file has no usable file stem, skipping");
            batch.reports.push(report(
                None,
                None,
                FileStatus::Malformed,
                Some("file name does not name a channel".to_string()),
            ));
            continue;
        };

        let hash = compute_hash(&channel, input.contents);
        if existing_hashes.contains(&hash) || !seen.insert(hash.clone()) {
            info!(path = input.path, "Channel file already loaded, skipping");
            batch.reports.push(report(
                Some(channel.as_str()),
                Some(hash.as_str()),
                FileStatus::Duplicate,
                None,
            ));
            continue;
        }

        let Ok(content) = std::str::from_utf8(input.contents) else {
            error!(path = input.path, "Channel file is not valid UTF-8, skipping");
            batch.reports.push(report(
                Some(channel.as_str()),
                Some(hash.as_str()),
                FileStatus::Malformed,
                Some("file contents were not valid UTF-8".to_string()),
            ));
            continue;
        };

        match parse_channel_file(&channel, content) {
            Ok(parsed) => {
                for issue in &parsed.skipped {
                    warn!(
                        path = input.path,
                        index = issue.index,
                        reason = %issue.reason,
                        "Skipping channel record"
                    );
                }
                for issue in &parsed.warnings {
                    warn!(
                        path = input.path,
                        index = issue.index,
                        reason = %issue.reason,
                        "Keeping channel record without a date"
                    );
                }
                let mut file_report = report(
                    Some(channel.as_str()),
                    Some(hash.as_str()),
                    FileStatus::Parsed,
                    None,
                );
                file_report.records = parsed.messages.len();
                file_report.skipped_records = parsed.skipped.len();
                file_report.undated_records = parsed.warnings.len();
                batch.reports.push(file_report);
                batch.new_files.push(LoadedFile {
                    hash,
                    path: input.path.to_string(),
                    channel,
                    record_count: parsed.messages.len(),
                });
                batch.messages.extend(parsed.messages);
            }
            Err(ParserError::EmptyFile) => {
                warn!(path = input.path, "Channel file is empty, skipping");
                batch.reports.push(report(
                    Some(channel.as_str()),
                    Some(hash.as_str()),
                    FileStatus::Empty,
                    None,
                ));
            }
            Err(err) => {
                error!(path = input.path, "Channel file is malformed, skipping: {err}");
                batch.reports.push(report(
                    Some(channel.as_str()),
                    Some(hash.as_str()),
                    FileStatus::Malformed,
                    Some(err.to_string()),
                ));
            }
        }
    }

    batch
}

/// `<messages_dir>/*/*.json`, sorted.
pub fn discover_channel_files(messages_dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = messages_dir.join("*").join("*.json");
    let pattern = pattern.to_string_lossy();
    let mut files = Vec::new();
    for entry in glob::glob(&pattern).with_context(|| format!("invalid glob {pattern}"))? {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(err) => error!("Unreadable entry under {}: {err}", messages_dir.display()),
        }
    }
    files.sort();
    Ok(files)
}

/// Loads every channel file under the layout's messages directory into
/// `raw_telegram_messages`. All inserts of a run commit together.
pub async fn load_raw_messages(pool: &DbPool, layout: &DataLayout) -> Result<LoadReport> {
    db::run_migrations(pool).await?;

    let messages_dir = layout.messages_dir();
    let paths = discover_channel_files(&messages_dir)?;
    info!(path = %messages_dir.display(), files = paths.len(), "Discovered channel files");

    let mut unreadable = Vec::new();
    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let shown = tgflux_parser::path_key(path);
        match tokio::fs::read(path).await {
            Ok(contents) => files.push((shown, contents)),
            Err(err) => {
                error!(path = %shown, "Channel file is unreadable, skipping: {err}");
                unreadable.push(FileReport {
                    path: shown,
                    channel: None,
                    hash: None,
                    status: FileStatus::Unreadable,
                    records: 0,
                    skipped_records: 0,
                    undated_records: 0,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    let inputs: Vec<ChannelFileInput<'_>> = files
        .iter()
        .map(|(path, contents)| ChannelFileInput {
            path,
            contents,
        })
        .collect();

    let mut tx = pool.begin().await?;
    let existing = load_existing_hashes(&mut tx).await?;
    let batch = ingest_channel_files(&inputs, &existing);

    let inserted = insert_messages(&mut tx, &batch.messages).await?;
    insert_loaded_files(&mut tx, &batch.new_files).await?;
    tx.commit()
        .await
        .with_context(|| "failed to commit raw load")?;

    let records = batch.messages.len();
    let duplicates = records as u64 - inserted;
    info!(records, inserted, duplicates, "Raw load committed");

    let mut reports = unreadable;
    reports.extend(batch.reports);
    reports.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(LoadReport {
        files: reports,
        records,
        inserted,
        duplicates,
    })
}

async fn load_existing_hashes(tx: &mut sqlx::PgConnection) -> Result<HashSet<String>> {
    let rows = sqlx::query(r#"SELECT file_hash FROM loaded_channel_files"#)
        .fetch_all(&mut *tx)
        .await?;

    let mut hashes = HashSet::with_capacity(rows.len());
    for row in rows {
        hashes.insert(row.try_get("file_hash")?);
    }
    Ok(hashes)
}

async fn insert_messages(tx: &mut sqlx::PgConnection, messages: &[RawMessage]) -> Result<u64> {
    let mut inserted = 0;
    for chunk in messages.chunks(INSERT_CHUNK_ROWS) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO raw_telegram_messages \
             (channel, id, message, date, sender_id, downloaded_image_path) ",
        );
        builder.push_values(chunk, |mut row, message| {
            row.push_bind(&message.channel)
                .push_bind(message.id)
                .push_bind(&message.message)
                .push_bind(message.date)
                .push_bind(message.sender_id)
                .push_bind(&message.downloaded_image_path);
        });
        builder.push(" ON CONFLICT (channel, id) DO NOTHING");
        let result = builder
            .build()
            .execute(&mut *tx)
            .await
            .with_context(|| "failed to insert raw messages")?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

async fn insert_loaded_files(tx: &mut sqlx::PgConnection, files: &[LoadedFile]) -> Result<()> {
    for file in files {
        sqlx::query(
            r#"
                INSERT INTO loaded_channel_files (file_hash, path, channel, record_count)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (file_hash) DO NOTHING
            "#,
        )
        .bind(&file.hash)
        .bind(&file.path)
        .bind(&file.channel)
        .bind(i32::try_from(file.record_count).unwrap_or(i32::MAX))
        .execute(&mut *tx)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(path: &'a str, contents: &'a str) -> ChannelFileInput<'a> {
        ChannelFileInput {
            path,
            contents: contents.as_bytes(),
        }
    }

    #[test]
    fn empty_and_malformed_files_do_not_stop_siblings() {
        let inputs = [
            input("2025-03-14/CheMed123.json", r#"[{"id": 1, "message": "a"}]"#),
            input("2025-03-14/empty.json", "   "),
            input("2025-03-14/broken.json", "[{"),
            input("2025-03-14/tenamereja.json", r#"[{"id": 1}, {"id": 2}]"#),
        ];

        let batch = ingest_channel_files(&inputs, &HashSet::new());

        let statuses: Vec<FileStatus> = batch.reports.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                FileStatus::Parsed,
                FileStatus::Empty,
                FileStatus::Malformed,
                FileStatus::Parsed
            ]
        );
        assert_eq!(batch.messages.len(), 3);
        assert_eq!(batch.new_files.len(), 2);
        assert!(batch.reports[2].error.is_some());
    }

    #[test]
    fn known_and_repeated_hashes_are_duplicates() {
        let content = r#"[{"id": 7}]"#;
        let existing: HashSet<String> = [compute_hash("CheMed123", content.as_bytes())].into();
        let inputs = [
            input("2025-03-13/CheMed123.json", content),
            input("2025-03-14/tikvahpharma.json", content),
            input("2025-03-15/tikvahpharma.json", content),
        ];

        let batch = ingest_channel_files(&inputs, &existing);

        assert_eq!(batch.reports[0].status, FileStatus::Duplicate);
        assert_eq!(batch.reports[1].status, FileStatus::Parsed);
        assert_eq!(batch.reports[2].status, FileStatus::Duplicate);
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].channel, "tikvahpharma");
    }

    #[test]
    fn records_with_unreadable_dates_are_loaded_undated() {
        let inputs = [input(
            "2025-03-14/CheMed123.json",
            r#"[{"id": 1, "message": "Paracetamol", "date": "14/03/2025"}, {"id": 2, "date": "2025-03-14T08:00:00Z"}]"#,
        )];

        let batch = ingest_channel_files(&inputs, &HashSet::new());

        assert_eq!(batch.reports[0].status, FileStatus::Parsed);
        assert_eq!(batch.reports[0].records, 2);
        assert_eq!(batch.reports[0].skipped_records, 0);
        assert_eq!(batch.reports[0].undated_records, 1);
        assert!(batch.messages[0].date.is_none());
        assert_eq!(batch.messages[0].message.as_deref(), Some("Paracetamol"));
        assert!(batch.messages[1].date.is_some());
    }

    #[test]
    fn hash_depends_on_channel() {
        assert_ne!(compute_hash("a", b"[]"), compute_hash("b", b"[]"));
        assert_eq!(compute_hash("a", b"[]"), compute_hash("a", b"[]"));
    }

    #[test]
    fn discovery_is_sorted_and_one_level_deep() {
        let dir = tempfile::tempdir().unwrap();
        for relative in [
            "2025-03-14/tikvahpharma.json",
            "2025-03-13/CheMed123.json",
            "2025-03-14/CheMed123.json",
            "2025-03-14/notes.txt",
            "2025-03-14/nested/deep.json",
        ] {
            let path = dir.path().join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "[]").unwrap();
        }

        let files = discover_channel_files(dir.path()).unwrap();
        let relative: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(
            relative,
            vec![
                "2025-03-13/CheMed123.json",
                "2025-03-14/CheMed123.json",
                "2025-03-14/tikvahpharma.json"
            ]
        );
    }
}
