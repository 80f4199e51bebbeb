//! Job store: the durable record of every job, with conditional (atomic)
//! stage transitions. This is the only shared mutable state in the system;
//! every other component interacts with it through the claim service or
//! through read-only queries.

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::job::{Job, Scene, Stage};

/// Durable store for jobs and the per-day upload quota counter.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to job store...");
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!("Job store ready");
        Ok(store)
    }

    /// For tests and local development: an in-memory-backed sqlite-less
    /// fallback is not provided. Integration tests use a real Postgres
    /// reachable via `DATABASE_URL`; unit tests exercise the pure logic
    /// in `job.rs`, `claim.rs`, and `gate.rs` instead.
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id              TEXT PRIMARY KEY,
                channel_id      TEXT NOT NULL,
                title           TEXT NOT NULL,
                summary         TEXT NOT NULL,
                link            TEXT NOT NULL,
                rss_title       TEXT NOT NULL,
                stage           TEXT NOT NULL,
                failure_step    TEXT,
                error_message   TEXT,
                validation_errors JSONB NOT NULL DEFAULT '[]',
                retry_count     INT NOT NULL DEFAULT 0,
                regen_count     INT NOT NULL DEFAULT 0,
                progress        SMALLINT NOT NULL DEFAULT 0,
                current_step    TEXT NOT NULL DEFAULT '',
                file_path       TEXT,
                thumbnail_path  TEXT,
                youtube_url     TEXT,
                tags            JSONB NOT NULL DEFAULT '[]',
                sources         JSONB NOT NULL DEFAULT '[]',
                description     TEXT NOT NULL DEFAULT '',
                scenes          JSONB NOT NULL DEFAULT '[]',
                created_at      TIMESTAMPTZ NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS jobs_channel_link_uq
               ON jobs (channel_id, link) WHERE stage NOT IN ('FAILED', 'BLOCKED', 'UPLOADED')"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(r#"CREATE INDEX IF NOT EXISTS jobs_channel_stage_idx ON jobs (channel_id, stage)"#)
            .execute(&self.pool)
            .await?;
        sqlx::query(r#"CREATE INDEX IF NOT EXISTS jobs_channel_stage_updated_idx ON jobs (channel_id, stage, updated_at)"#)
            .execute(&self.pool)
            .await?;
        sqlx::query(r#"CREATE INDEX IF NOT EXISTS jobs_channel_created_idx ON jobs (channel_id, created_at)"#)
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS quota_usage (
                channel_id TEXT NOT NULL,
                day        DATE NOT NULL,
                consumed   INT NOT NULL DEFAULT 0,
                PRIMARY KEY (channel_id, day)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS system_settings (
                channel_id TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                PRIMARY KEY (channel_id, key)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts a brand-new job. The unique index on (channel_id, link)
    /// rejects true duplicates at the storage layer as a backstop to the
    /// ingestion gate's own dedup pass (P3).
    pub async fn insert(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, channel_id, title, summary, link, rss_title, stage,
                failure_step, error_message, validation_errors, retry_count, regen_count,
                progress, current_step, file_path, thumbnail_path, youtube_url,
                tags, sources, description, scenes, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23
            )
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(&job.channel_id)
        .bind(&job.title)
        .bind(&job.summary)
        .bind(&job.link)
        .bind(&job.rss_title)
        .bind(job.stage.as_str())
        .bind(&job.failure_step)
        .bind(&job.error_message)
        .bind(serde_json::to_value(&job.validation_errors)?)
        .bind(job.retry_count as i32)
        .bind(job.regen_count as i32)
        .bind(job.progress as i16)
        .bind(&job.current_step)
        .bind(&job.file_path)
        .bind(&job.thumbnail_path)
        .bind(&job.youtube_url)
        .bind(serde_json::to_value(&job.tags)?)
        .bind(serde_json::to_value(&job.sources)?)
        .bind(&job.description)
        .bind(serde_json::to_value(&job.scenes)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => PipelineError::DuplicateJob {
                channel_id: job.channel_id.clone(),
                link: job.link.clone(),
            },
            _ => PipelineError::from(e),
        })?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::DuplicateJob {
                channel_id: job.channel_id.clone(),
                link: job.link.clone(),
            });
        }
        debug!(job_id = %job.id, channel_id = %job.channel_id, "job inserted");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(r#"SELECT * FROM jobs WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    /// Counts jobs in non-terminal stages for a channel (ingestion gate
    /// capacity check).
    pub async fn count_active(&self, channel_id: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"SELECT COUNT(*) AS n FROM jobs WHERE channel_id = $1
               AND stage NOT IN ('UPLOADED', 'FAILED', 'BLOCKED')"#,
        )
        .bind(channel_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// Resolves a job by its channel + normalized link, used by the
    /// Scripting stage worker to recover `jobId` from an ingestion event
    /// that only carries the source URL.
    pub async fn find_by_link(&self, channel_id: &str, normalized_link: &str) -> Result<Option<Job>> {
        let row = sqlx::query(r#"SELECT * FROM jobs WHERE channel_id = $1 AND link = $2"#)
            .bind(channel_id)
            .bind(normalized_link)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    pub async fn link_exists(&self, channel_id: &str, normalized_link: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"SELECT EXISTS(SELECT 1 FROM jobs WHERE channel_id = $1 AND link = $2) AS e"#,
        )
        .bind(channel_id)
        .bind(normalized_link)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<bool, _>("e")?)
    }

    pub async fn title_exists(&self, channel_id: &str, title: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"SELECT EXISTS(
                SELECT 1 FROM jobs WHERE channel_id = $1
                AND (lower(title) = lower($2) OR lower(rss_title) = lower($2))
            ) AS e"#,
        )
        .bind(channel_id)
        .bind(title)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<bool, _>("e")?)
    }

    /// Most recent jobs for a channel, used by the semantic-similarity
    /// collaborator to compare a candidate against recent history.
    pub async fn recent(&self, channel_id: &str, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(r#"SELECT * FROM jobs WHERE channel_id = $1 ORDER BY created_at DESC LIMIT $2"#)
            .bind(channel_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    /// Oldest job in a given stage for a channel (upload scheduler pick,
    /// stale-job reconciler scan).
    pub async fn oldest_in_stage(&self, channel_id: &str, stage: Stage) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"SELECT * FROM jobs WHERE channel_id = $1 AND stage = $2 ORDER BY created_at ASC LIMIT 1"#,
        )
        .bind(channel_id)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_job).transpose()
    }

    pub async fn latest_in_stage(&self, channel_id: &str, stage: Stage) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"SELECT * FROM jobs WHERE channel_id = $1 AND stage = $2 ORDER BY updated_at DESC LIMIT 1"#,
        )
        .bind(channel_id)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_job).transpose()
    }

    /// Jobs stuck in a non-terminal, non-queued stage past `max_age` (the
    /// stale-job reconciler, §7.7).
    pub async fn stale_active(&self, max_age: chrono::Duration) -> Result<Vec<Job>> {
        let cutoff = Utc::now() - max_age;
        let rows = sqlx::query(
            r#"SELECT * FROM jobs WHERE updated_at < $1
               AND stage IN ('SCRIPTING', 'ASSETS_GENERATING', 'RENDERING', 'UPLOADING')"#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    /// The single atomic conditional write every stage mutation goes
    /// through. `expected_stage` is part of the WHERE clause so the update
    /// either fully succeeds (and bumps `updated_at`) or fully no-ops;
    /// never a read-then-write race. Returns whether the row matched.
    pub async fn compare_and_update(
        &self,
        job_id: &str,
        expected_stage: Stage,
        apply: impl FnOnce(&mut Job),
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(r#"SELECT * FROM jobs WHERE id = $1 AND stage = $2 FOR UPDATE"#)
            .bind(job_id)
            .bind(expected_stage.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let mut job = row_to_job(row)?;
        apply(&mut job);
        job.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE jobs SET
                title = $2, summary = $3, link = $4, rss_title = $5, stage = $6,
                failure_step = $7, error_message = $8, validation_errors = $9,
                retry_count = $10, regen_count = $11, progress = $12, current_step = $13,
                file_path = $14, thumbnail_path = $15, youtube_url = $16,
                tags = $17, sources = $18, description = $19, scenes = $20, updated_at = $21
            WHERE id = $1
            "#,
        )
        .bind(&job.id)
        .bind(&job.title)
        .bind(&job.summary)
        .bind(&job.link)
        .bind(&job.rss_title)
        .bind(job.stage.as_str())
        .bind(&job.failure_step)
        .bind(&job.error_message)
        .bind(serde_json::to_value(&job.validation_errors)?)
        .bind(job.retry_count as i32)
        .bind(job.regen_count as i32)
        .bind(job.progress as i16)
        .bind(&job.current_step)
        .bind(&job.file_path)
        .bind(&job.thumbnail_path)
        .bind(&job.youtube_url)
        .bind(serde_json::to_value(&job.tags)?)
        .bind(serde_json::to_value(&job.sources)?)
        .bind(&job.description)
        .bind(serde_json::to_value(&job.scenes)?)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Writes fields on a job without a stage precondition (progress
    /// callbacks, diagnostics). Never changes `stage`.
    pub async fn update_progress(&self, job_id: &str, progress: u8, current_step: &str) -> Result<()> {
        sqlx::query(r#"UPDATE jobs SET progress = $2, current_step = $3, updated_at = $4 WHERE id = $1"#)
            .bind(job_id)
            .bind(progress as i16)
            .bind(current_step)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn quota_consumed(&self, channel_id: &str, day: chrono::NaiveDate) -> Result<i32> {
        let row = sqlx::query(r#"SELECT consumed FROM quota_usage WHERE channel_id = $1 AND day = $2"#)
            .bind(channel_id)
            .bind(day)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<i32, _>("consumed")).transpose()?.unwrap_or(0))
    }

    pub async fn increment_quota(&self, channel_id: &str, day: chrono::NaiveDate) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO quota_usage (channel_id, day, consumed) VALUES ($1, $2, 1)
               ON CONFLICT (channel_id, day) DO UPDATE SET consumed = quota_usage.consumed + 1"#,
        )
        .bind(channel_id)
        .bind(day)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_setting(&self, channel_id: &str, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(r#"SELECT value FROM system_settings WHERE channel_id = $1 AND key = $2"#)
            .bind(channel_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }

    pub async fn set_setting(&self, channel_id: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO system_settings (channel_id, key, value) VALUES ($1, $2, $3)
               ON CONFLICT (channel_id, key) DO UPDATE SET value = EXCLUDED.value"#,
        )
        .bind(channel_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<Job> {
    let stage_str: String = row.try_get("stage")?;
    let stage = parse_stage(&stage_str)?;
    Ok(Job {
        id: row.try_get("id")?,
        channel_id: row.try_get("channel_id")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        link: row.try_get("link")?,
        rss_title: row.try_get("rss_title")?,
        stage,
        failure_step: row.try_get("failure_step")?,
        error_message: row.try_get("error_message")?,
        validation_errors: serde_json::from_value(row.try_get("validation_errors")?)?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        regen_count: row.try_get::<i32, _>("regen_count")? as u32,
        progress: row.try_get::<i16, _>("progress")? as u8,
        current_step: row.try_get("current_step")?,
        file_path: row.try_get("file_path")?,
        thumbnail_path: row.try_get("thumbnail_path")?,
        youtube_url: row.try_get("youtube_url")?,
        tags: serde_json::from_value(row.try_get("tags")?)?,
        sources: serde_json::from_value(row.try_get("sources")?)?,
        description: row.try_get("description")?,
        scenes: serde_json::from_value::<Vec<Scene>>(row.try_get("scenes")?)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn parse_stage(s: &str) -> Result<Stage> {
    Ok(match s {
        "QUEUED" => Stage::Queued,
        "SCRIPTING" => Stage::Scripting,
        "ASSETS_QUEUED" => Stage::AssetsQueued,
        "ASSETS_GENERATING" => Stage::AssetsGenerating,
        "RENDER_QUEUED" => Stage::RenderQueued,
        "RENDERING" => Stage::Rendering,
        "COMPLETED" => Stage::Completed,
        "UPLOADING" => Stage::Uploading,
        "UPLOADED" => Stage::Uploaded,
        "UPLOAD_FAILED" => Stage::UploadFailed,
        "RETRY_QUEUED" => Stage::RetryQueued,
        "FAILED" => Stage::Failed,
        "BLOCKED" => Stage::Blocked,
        other => return Err(PipelineError::StoreError(format!("unknown stage in store: {other}"))),
    })
}
