use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tgflux_parser::ChannelName;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{EnrichmentConfig, PipelineConfig, TransformConfig};
use crate::db::{self, DbPool};
use crate::detector::Detector;
use crate::enrichment;
use crate::layout::DataLayout;
use crate::loader;
use crate::run_lock::{RunLock, PIPELINE_LOCK_KEY};
use crate::scraper;
use crate::sources::MessageSource;
use crate::transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scrape,
    RawLoad,
    Transform,
    Enrich,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scrape => "scrape",
            Stage::RawLoad => "raw_load",
            Stage::Transform => "transform",
            Stage::Enrich => "enrich",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Schedule,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Schedule => "schedule",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    NotRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub stage: Stage,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobReport {
    pub steps: Vec<StepReport>,
}

impl JobReport {
    pub fn failed_step(&self) -> Option<&StepReport> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "SUCCEEDED",
            RunOutcome::Failed => "FAILED",
            RunOutcome::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReceipt {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepReport>,
}

#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn stage(&self) -> Stage;

    /// Runs the stage and returns its summary for the run receipt.
    async fn run(&self) -> Result<Value>;
}

/// Runs `steps` in order. The first failure stops the job and every later
/// step is reported as not run.
pub async fn run_steps(steps: &[&dyn PipelineStep], timeout: Option<Duration>) -> JobReport {
    let mut report = JobReport::default();
    let mut failed = false;

    for step in steps {
        let stage = step.stage();
        if failed {
            report.steps.push(StepReport {
                stage,
                status: StepStatus::NotRun,
                summary: None,
                error: None,
                duration_ms: None,
            });
            continue;
        }

        info!(stage = %stage, "Starting stage");
        let started = Instant::now();
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, step.run()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "stage {stage} timed out after {}s",
                    limit.as_secs()
                )),
            },
            None => step.run().await,
        };
        let duration_ms = Some(started.elapsed().as_millis() as u64);

        match result {
            Ok(summary) => {
                info!(stage = %stage, duration_ms, "Stage succeeded");
                report.steps.push(StepReport {
                    stage,
                    status: StepStatus::Succeeded,
                    summary: Some(summary),
                    error: None,
                    duration_ms,
                });
            }
            Err(err) => {
                error!(stage = %stage, "Stage failed: {err:#}");
                failed = true;
                report.steps.push(StepReport {
                    stage,
                    status: StepStatus::Failed,
                    summary: None,
                    error: Some(format!("{err:#}")),
                    duration_ms,
                });
            }
        }
    }

    report
}

pub struct ScrapeStep<'a> {
    pub source: &'a dyn MessageSource,
    pub layout: &'a DataLayout,
    pub channels: &'a [ChannelName],
    pub limit: usize,
}

#[async_trait]
impl PipelineStep for ScrapeStep<'_> {
    fn stage(&self) -> Stage {
        Stage::Scrape
    }

    async fn run(&self) -> Result<Value> {
        let report =
            scraper::scrape_channels(self.source, self.layout, self.channels, self.limit).await?;
        Ok(serde_json::to_value(report)?)
    }
}

pub struct RawLoadStep<'a> {
    pub pool: &'a DbPool,
    pub layout: &'a DataLayout,
}

#[async_trait]
impl PipelineStep for RawLoadStep<'_> {
    fn stage(&self) -> Stage {
        Stage::RawLoad
    }

    async fn run(&self) -> Result<Value> {
        let report = loader::load_raw_messages(self.pool, self.layout).await?;
        Ok(serde_json::to_value(report)?)
    }
}

pub struct TransformStep<'a> {
    pub config: &'a TransformConfig,
}

#[async_trait]
impl PipelineStep for TransformStep<'_> {
    fn stage(&self) -> Stage {
        Stage::Transform
    }

    async fn run(&self) -> Result<Value> {
        let report = transform::run_transform(self.config).await?;
        Ok(serde_json::to_value(report)?)
    }
}

pub struct EnrichStep<'a> {
    pub pool: &'a DbPool,
    pub layout: &'a DataLayout,
    pub detector: &'a dyn Detector,
    pub config: &'a EnrichmentConfig,
}

#[async_trait]
impl PipelineStep for EnrichStep<'_> {
    fn stage(&self) -> Stage {
        Stage::Enrich
    }

    async fn run(&self) -> Result<Value> {
        let report =
            enrichment::enrich_images(self.pool, self.layout, self.detector, self.config).await?;
        if let Some(err) = &report.insert_error {
            bail!("failed to store detections: {err}");
        }
        Ok(serde_json::to_value(report)?)
    }
}

/// Owns everything a pipeline run needs. Runs are single-flight within the
/// process and across processes sharing the database.
pub struct Orchestrator {
    pool: DbPool,
    config: PipelineConfig,
    layout: DataLayout,
    channels: Vec<ChannelName>,
    source: Box<dyn MessageSource>,
    detector: Box<dyn Detector>,
    in_flight: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        pool: DbPool,
        config: PipelineConfig,
        source: Box<dyn MessageSource>,
        detector: Box<dyn Detector>,
    ) -> Result<Self> {
        let channels = config.scrape.channel_names()?;
        let layout = config.layout();
        Ok(Self {
            pool,
            config,
            layout,
            channels,
            source,
            detector,
            in_flight: Mutex::new(()),
        })
    }

    pub async fn run(&self, trigger: Trigger) -> Result<RunReceipt> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!(run_id = %run_id, "A pipeline run is already in progress in this process, skipping");
            return self.record_skipped(run_id, trigger, started_at).await;
        };

        db::run_migrations(&self.pool).await?;

        let Some(lock) = RunLock::try_acquire(&self.pool, PIPELINE_LOCK_KEY).await? else {
            warn!(run_id = %run_id, "Another process holds the pipeline lock, skipping");
            return self.record_skipped(run_id, trigger, started_at).await;
        };

        let result = self.run_locked(run_id, trigger, started_at).await;
        lock.release().await?;
        result
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        trigger: Trigger,
        started_at: DateTime<Utc>,
    ) -> Result<RunReceipt> {
        let abandoned = fail_abandoned_runs(&self.pool).await?;
        if abandoned > 0 {
            warn!(runs = abandoned, "Marked runs that never recorded an outcome as FAILED");
        }

        sqlx::query(
            r#"
                INSERT INTO pipeline_runs (run_id, trigger, started_at, outcome)
                VALUES ($1, $2, $3, 'RUNNING')
            "#,
        )
        .bind(run_id)
        .bind(trigger.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to record pipeline run")?;
        info!(run_id = %run_id, trigger = trigger.as_str(), "Pipeline run started");

        let scrape = ScrapeStep {
            source: self.source.as_ref(),
            layout: &self.layout,
            channels: &self.channels,
            limit: self.config.scrape.message_limit,
        };
        let raw_load = RawLoadStep {
            pool: &self.pool,
            layout: &self.layout,
        };
        let transform = TransformStep {
            config: &self.config.transform,
        };
        let enrich = EnrichStep {
            pool: &self.pool,
            layout: &self.layout,
            detector: self.detector.as_ref(),
            config: &self.config.enrichment,
        };
        let steps: [&dyn PipelineStep; 4] = [&scrape, &raw_load, &transform, &enrich];

        let job = run_steps(&steps, self.config.pipeline.stage_timeout()).await;
        let failed = job.failed_step();
        let receipt = RunReceipt {
            run_id,
            trigger,
            outcome: if failed.is_some() {
                RunOutcome::Failed
            } else {
                RunOutcome::Succeeded
            },
            started_at,
            finished_at: Utc::now(),
            failed_stage: failed.map(|step| step.stage),
            error: failed.and_then(|step| step.error.clone()),
            steps: job.steps.clone(),
        };

        sqlx::query(
            r#"
                UPDATE pipeline_runs
                SET finished_at = $1,
                    outcome = $2,
                    failed_stage = $3,
                    error = $4,
                    receipt = $5
                WHERE run_id = $6
            "#,
        )
        .bind(receipt.finished_at)
        .bind(receipt.outcome.as_str())
        .bind(receipt.failed_stage.map(|stage| stage.as_str()))
        .bind(&receipt.error)
        .bind(serde_json::to_value(&receipt)?)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to record pipeline run outcome")?;

        info!(run_id = %run_id, outcome = receipt.outcome.as_str(), "Pipeline run finished");
        Ok(receipt)
    }

    async fn record_skipped(
        &self,
        run_id: Uuid,
        trigger: Trigger,
        started_at: DateTime<Utc>,
    ) -> Result<RunReceipt> {
        let receipt = RunReceipt {
            run_id,
            trigger,
            outcome: RunOutcome::Skipped,
            started_at,
            finished_at: Utc::now(),
            failed_stage: None,
            error: Some("a pipeline run is already in progress".to_string()),
            steps: Vec::new(),
        };

        db::run_migrations(&self.pool).await?;
        sqlx::query(
            r#"
                INSERT INTO pipeline_runs (run_id, trigger, started_at, finished_at, outcome, error, receipt)
                VALUES ($1, $2, $3, $4, 'SKIPPED', $5, $6)
            "#,
        )
        .bind(run_id)
        .bind(trigger.as_str())
        .bind(started_at)
        .bind(receipt.finished_at)
        .bind(&receipt.error)
        .bind(serde_json::to_value(&receipt)?)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to record skipped pipeline run")?;
        Ok(receipt)
    }
}

/// Marks every `RUNNING` row as `FAILED`. Only call this while holding the
/// pipeline lock: any run still `RUNNING` then lost its process before it
/// could record an outcome.
pub async fn fail_abandoned_runs(pool: &DbPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
            UPDATE pipeline_runs
            SET outcome = 'FAILED',
                finished_at = now(),
                error = 'run ended without recording an outcome'
            WHERE outcome = 'RUNNING'
        "#,
    )
    .execute(pool)
    .await
    .with_context(|| "failed to close abandoned pipeline runs")?;
    Ok(result.rows_affected())
}

/// One `pipeline_runs` row, without its receipt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: String,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
}

/// The most recent runs, newest first.
pub async fn recent_runs(pool: &DbPool, limit: i64) -> Result<Vec<RunRecord>> {
    db::run_migrations(pool).await?;
    let runs = sqlx::query_as::<_, RunRecord>(
        r#"
            SELECT run_id, trigger, started_at, finished_at, outcome, failed_stage, error
            FROM pipeline_runs
            ORDER BY started_at DESC
            LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(runs)
}
