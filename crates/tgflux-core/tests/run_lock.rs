use std::env;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tgflux_core::{
    db,
    detector::{Detection, Detector, DetectorError},
    orchestrator::fail_abandoned_runs,
    run_lock::{RunLock, PIPELINE_LOCK_KEY},
    sources::{MessageSource, SourceMessage},
    Orchestrator, PipelineConfig, RunOutcome, Trigger,
};
use tgflux_parser::ChannelName;
use tokio::runtime::Runtime;
use uuid::Uuid;

struct NoMessages;

#[async_trait]
impl MessageSource for NoMessages {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn recent_messages(&self, _: &ChannelName, _: usize) -> Result<Vec<SourceMessage>> {
        Ok(Vec::new())
    }

    async fn download_photo(&self, _: &ChannelName, _: i64, _: &Path) -> Result<()> {
        Ok(())
    }
}

struct NoDetections;

#[async_trait]
impl Detector for NoDetections {
    async fn detect(&self, _: &Path) -> Result<Vec<Detection>, DetectorError> {
        Ok(Vec::new())
    }
}

#[test]
fn held_run_lock_skips_the_trigger() -> Result<()> {
    let database_url = match env::var("TGFLUX_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping run lock integration test because TGFLUX_TEST_DATABASE_URL is not set");
            return Ok(());
        }
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = db::connect_url(&database_url).await?;
        db::run_migrations(&pool).await?;

        let data = tempfile::tempdir()?;
        let mut config = PipelineConfig::default();
        config.paths.data_root = data.path().join("data");
        config.paths.log_dir = data.path().join("logs");
        let orchestrator = Orchestrator::new(
            pool.clone(),
            config,
            Box::new(NoMessages),
            Box::new(NoDetections),
        )?;

        let held = RunLock::try_acquire(&pool, PIPELINE_LOCK_KEY)
            .await?
            .expect("lock should be free at test start");
        assert!(RunLock::try_acquire(&pool, PIPELINE_LOCK_KEY).await?.is_none());

        let receipt = orchestrator.run(Trigger::Schedule).await?;
        assert_eq!(receipt.outcome, RunOutcome::Skipped);
        assert!(receipt.steps.is_empty());

        let (outcome, trigger): (String, String) =
            sqlx::query_as("SELECT outcome, trigger FROM pipeline_runs WHERE run_id = $1")
                .bind(receipt.run_id)
                .fetch_one(&pool)
                .await?;
        assert_eq!(outcome, "SKIPPED");
        assert_eq!(trigger, "schedule");

        // A run whose process died keeps its RUNNING row until the next lock holder closes it.
        let abandoned = Uuid::new_v4();
        sqlx::query("INSERT INTO pipeline_runs (run_id, trigger, outcome) VALUES ($1, 'manual', 'RUNNING')")
            .bind(abandoned)
            .execute(&pool)
            .await?;
        assert!(fail_abandoned_runs(&pool).await? >= 1);
        let (outcome, finished): (String, Option<chrono::DateTime<chrono::Utc>>) =
            sqlx::query_as("SELECT outcome, finished_at FROM pipeline_runs WHERE run_id = $1")
                .bind(abandoned)
                .fetch_one(&pool)
                .await?;
        assert_eq!(outcome, "FAILED");
        assert!(finished.is_some());

        held.release().await?;
        let again = RunLock::try_acquire(&pool, PIPELINE_LOCK_KEY).await?;
        assert!(again.is_some());
        if let Some(lock) = again {
            lock.release().await?;
        }

        sqlx::query("DELETE FROM pipeline_runs WHERE run_id = ANY($1)")
            .bind(vec![receipt.run_id, abandoned])
            .execute(&pool)
            .await?;
        Ok(())
    })
}
