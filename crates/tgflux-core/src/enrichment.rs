use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Postgres, QueryBuilder, Row};
use tgflux_parser::{has_image_extension, parse_media_path, path_key, MediaKey, MediaManifest};
use tracing::{error, info, warn};

use crate::config::EnrichmentConfig;
use crate::db::{self, DbPool};
use crate::detector::{Detection, Detector};
use crate::layout::DataLayout;
use crate::media_manifest;

const INSERT_CHUNK_ROWS: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRow {
    pub message_id: i64,
    pub channel_name: String,
    pub detection_index: i32,
    pub image_path: String,
    pub detected_object_class: String,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedImage {
    pub key: MediaKey,
    pub image_path: String,
    pub detection_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentReport {
    pub images_found: usize,
    pub already_enriched: usize,
    pub unresolved: usize,
    pub failed: usize,
    pub processed: usize,
    pub below_threshold: usize,
    pub detections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct DetectionBatch {
    pub rows: Vec<DetectionRow>,
    pub images: Vec<EnrichedImage>,
    pub report: EnrichmentReport,
}

/// Every file under `media_dir` with one of `extensions`, sorted.
pub fn discover_images(media_dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let pattern = media_dir.join("**").join("*");
    let pattern = pattern.to_string_lossy();
    let mut images = Vec::new();
    for entry in glob::glob(&pattern).with_context(|| format!("invalid glob {pattern}"))? {
        match entry {
            Ok(path) if path.is_file() && has_image_extension(&path, extensions) => {
                images.push(path)
            }
            Ok(_) => {}
            Err(err) => error!("Unreadable entry under {}: {err}", media_dir.display()),
        }
    }
    images.sort();
    Ok(images)
}

/// The manifest entry for `image` when present, otherwise
/// `<channel>/<message_id>.<ext>` parsed from the path.
pub fn resolve_media_key(
    image: &Path,
    manifest: &MediaManifest,
) -> Result<MediaKey, tgflux_parser::ParserError> {
    match manifest.lookup(&path_key(image)) {
        Some(key) => Ok(key.clone()),
        None => parse_media_path(image),
    }
}

/// Runs `detector` over `images`. Per-image problems are logged and counted;
/// only a fatal detector error aborts the walk.
pub async fn detect_images(
    detector: &dyn Detector,
    images: &[PathBuf],
    manifest: &MediaManifest,
    enriched: &HashSet<MediaKey>,
    threshold: f64,
) -> Result<DetectionBatch> {
    let mut batch = DetectionBatch::default();
    batch.report.images_found = images.len();
    let mut seen = HashSet::new();

    for image in images {
        let image_path = path_key(image);
        let key = match resolve_media_key(image, manifest) {
            Ok(key) => key,
            Err(err) => {
                warn!(path = %image_path, "Skipping image: {err}");
                batch.report.unresolved += 1;
                continue;
            }
        };
        if enriched.contains(&key) || seen.contains(&key) {
            batch.report.already_enriched += 1;
            continue;
        }

        let detections = match detector.detect(image).await {
            Ok(detections) => detections,
            Err(err) if err.is_fatal() => {
                return Err(err).with_context(|| format!("detector failed on {image_path}"));
            }
            Err(err) => {
                warn!(path = %image_path, "Detection failed, skipping image: {err}");
                batch.report.failed += 1;
                continue;
            }
        };

        if let Some(bad) = detections
            .iter()
            .find(|d| !(0.0..=1.0).contains(&d.confidence))
        {
            warn!(
                path = %image_path,
                class = %bad.class,
                confidence = bad.confidence,
                "Detector returned a confidence outside [0, 1], skipping image"
            );
            batch.report.failed += 1;
            continue;
        }

        let (kept, dropped): (Vec<Detection>, Vec<Detection>) = detections
            .into_iter()
            .partition(|d| d.confidence >= threshold);
        batch.report.below_threshold += dropped.len();
        batch.report.processed += 1;
        batch.report.detections += kept.len();

        batch.images.push(EnrichedImage {
            key: key.clone(),
            image_path: image_path.clone(),
            detection_count: kept.len(),
        });
        batch
            .rows
            .extend(kept.into_iter().enumerate().map(|(index, detection)| DetectionRow {
                message_id: key.message_id,
                channel_name: key.channel.clone(),
                detection_index: i32::try_from(index).unwrap_or(i32::MAX),
                image_path: image_path.clone(),
                detected_object_class: detection.class,
                confidence_score: detection.confidence,
            }));
        seen.insert(key);
    }

    Ok(batch)
}

/// Walks the media tree, detects objects in images not enriched before, and
/// stores the detections. An insert failure rolls the whole batch back and is
/// returned in [`EnrichmentReport::insert_error`].
pub async fn enrich_images(
    pool: &DbPool,
    layout: &DataLayout,
    detector: &dyn Detector,
    config: &EnrichmentConfig,
) -> Result<EnrichmentReport> {
    db::run_migrations(pool).await?;

    let media_dir = layout.media_dir();
    let images = discover_images(&media_dir, &config.image_extensions)?;
    let manifest = media_manifest::load(&layout.manifest_path()).await?;
    let enriched = load_enriched_keys(pool).await?;
    info!(
        path = %media_dir.display(),
        images = images.len(),
        manifest_entries = manifest.len(),
        "Starting enrichment"
    );

    let mut batch = detect_images(
        detector,
        &images,
        &manifest,
        &enriched,
        config.confidence_threshold,
    )
    .await?;

    if let Err(err) = store_batch(pool, &batch).await {
        error!("Failed to store detections, batch rolled back: {err:#}");
        batch.report.insert_error = Some(format!("{err:#}"));
    } else {
        info!(
            images = batch.images.len(),
            detections = batch.rows.len(),
            "Stored detections"
        );
    }

    Ok(batch.report)
}

async fn load_enriched_keys(pool: &DbPool) -> Result<HashSet<MediaKey>> {
    let rows = sqlx::query(r#"SELECT channel_name, message_id FROM enriched_images"#)
        .fetch_all(pool)
        .await?;
    let mut keys = HashSet::with_capacity(rows.len());
    for row in rows {
        keys.insert(MediaKey {
            channel: row.try_get("channel_name")?,
            message_id: row.try_get("message_id")?,
        });
    }
    Ok(keys)
}

async fn store_batch(pool: &DbPool, batch: &DetectionBatch) -> Result<()> {
    if batch.images.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;

    for chunk in batch.rows.chunks(INSERT_CHUNK_ROWS) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO image_detections \
             (message_id, channel_name, detection_index, image_path, detected_object_class, confidence_score) ",
        );
        builder.push_values(chunk, |mut row, detection| {
            row.push_bind(detection.message_id)
                .push_bind(&detection.channel_name)
                .push_bind(detection.detection_index)
                .push_bind(&detection.image_path)
                .push_bind(&detection.detected_object_class)
                .push_bind(detection.confidence_score);
        });
        builder
            .build()
            .execute(&mut *tx)
            .await
            .with_context(|| "failed to insert image detections")?;
    }

    for chunk in batch.images.chunks(INSERT_CHUNK_ROWS) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO enriched_images (channel_name, message_id, image_path, detection_count) ",
        );
        builder.push_values(chunk, |mut row, image| {
            row.push_bind(&image.key.channel)
                .push_bind(image.key.message_id)
                .push_bind(&image.image_path)
                .push_bind(i32::try_from(image.detection_count).unwrap_or(i32::MAX));
        });
        builder
            .build()
            .execute(&mut *tx)
            .await
            .with_context(|| "failed to record enriched images")?;
    }

    tx.commit().await?;
    Ok(())
}
