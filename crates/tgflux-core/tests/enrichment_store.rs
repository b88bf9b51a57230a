use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tgflux_core::{
    config::EnrichmentConfig,
    db,
    detector::{Detection, Detector, DetectorError},
    enrichment::enrich_images,
    layout::DataLayout,
};
use tokio::runtime::Runtime;

#[derive(Default)]
struct CountingDetector {
    calls: AtomicUsize,
}

#[async_trait]
impl Detector for CountingDetector {
    async fn detect(&self, _: &Path) -> Result<Vec<Detection>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            Detection {
                class: "bottle".into(),
                confidence: 0.9,
            },
            Detection {
                class: "cup".into(),
                confidence: 0.5,
            },
        ])
    }
}

fn add_image(layout: &DataLayout, relative: &str) {
    let path = layout.media_dir().join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"\xff\xd8\xff").unwrap();
}

async fn count(pool: &db::DbPool, table: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[test]
fn detections_are_stored_once_and_failed_batches_roll_back() -> Result<()> {
    let database_url = match env::var("TGFLUX_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping enrichment store integration test because TGFLUX_TEST_DATABASE_URL is not set");
            return Ok(());
        }
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = db::connect_url(&database_url).await?;
        db::run_migrations(&pool).await?;
        sqlx::query("TRUNCATE TABLE image_detections, enriched_images")
            .execute(&pool)
            .await?;

        let data = tempfile::tempdir()?;
        let layout = DataLayout::new(data.path().join("data"), data.path().join("logs"));
        add_image(&layout, "CheMed123/1.jpg");
        add_image(&layout, "CheMed123/2.jpg");
        let detector = CountingDetector::default();
        let config = EnrichmentConfig::default();

        let first = enrich_images(&pool, &layout, &detector, &config).await?;
        assert!(first.insert_error.is_none());
        assert_eq!(first.processed, 2);
        assert_eq!(first.detections, 4);
        assert_eq!(count(&pool, "image_detections").await?, 4);
        assert_eq!(count(&pool, "enriched_images").await?, 2);

        let second = enrich_images(&pool, &layout, &detector, &config).await?;
        assert_eq!(second.already_enriched, 2);
        assert_eq!(second.processed, 0);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 2);
        assert_eq!(count(&pool, "image_detections").await?, 4);

        // A leftover row for message 4 collides with the new batch's insert.
        add_image(&layout, "CheMed123/3.jpg");
        add_image(&layout, "CheMed123/4.jpg");
        sqlx::query(
            "INSERT INTO image_detections \
             (message_id, channel_name, detection_index, image_path, detected_object_class, confidence_score) \
             VALUES (4, 'CheMed123', 0, 'stale.jpg', 'person', 0.7)",
        )
        .execute(&pool)
        .await?;

        let third = enrich_images(&pool, &layout, &detector, &config).await?;
        assert!(third.insert_error.is_some());
        assert_eq!(third.processed, 2);
        assert_eq!(count(&pool, "image_detections").await?, 5);
        assert_eq!(count(&pool, "enriched_images").await?, 2);
        let (message_three,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM image_detections WHERE channel_name = 'CheMed123' AND message_id = 3",
        )
        .fetch_one(&pool)
        .await?;
        assert_eq!(message_three, 0);

        sqlx::query("TRUNCATE TABLE image_detections, enriched_images")
            .execute(&pool)
            .await?;
        Ok(())
    })
}
