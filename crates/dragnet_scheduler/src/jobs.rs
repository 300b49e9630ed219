//! Job governance.
//!
//! A job binds one assignment (uuid, tool config, target list) to a queue.
//! `retval` stays null while the agent works; any value marks the job
//! terminal and means its heatmap contribution has been drained exactly
//! once, either by output submission or by reconcile.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dragnet_db::{DbPool, Job, Queue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::heatmap;
use crate::lock::SchedulerLock;
use crate::net::hashval;
use crate::queues::QueueManager;

/// Work unit payload handed to an agent, serialized as JSON verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub config: Value,
    pub targets: Vec<String>,
}

/// Job lifecycle operations.
#[derive(Debug, Clone)]
pub struct JobManager {
    pool: DbPool,
    config: Arc<SchedulerConfig>,
    lock: SchedulerLock,
}

impl JobManager {
    pub fn new(pool: DbPool, config: Arc<SchedulerConfig>) -> Self {
        let lock = SchedulerLock::new(pool.clone());
        Self { pool, config, lock }
    }

    /// Fetch a job by id.
    pub async fn get(&self, job_id: &str) -> Result<Job> {
        sqlx::query_as("SELECT * FROM job WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SchedulerError::not_found(format!("job {job_id}")))
    }

    /// All jobs bound to a queue.
    pub async fn list_for_queue(&self, queue_id: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as("SELECT * FROM job WHERE queue_id = ?1 ORDER BY time_start")
            .bind(queue_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    /// Where a job's raw output bytes live.
    pub fn output_abspath(queue: &Queue, job_id: &str) -> PathBuf {
        Path::new(&queue.data_abspath).join(job_id)
    }

    /// Create a job for a queue with the given targets and return the
    /// assignment the agent receives.
    pub async fn create(&self, queue: &Queue, assigned_targets: Vec<String>) -> Result<Assignment> {
        let config = match queue.config.as_deref() {
            None => Value::Object(Default::default()),
            Some(text) => {
                let parsed: Value = serde_yaml::from_str(text)?;
                if parsed.is_null() {
                    Value::Object(Default::default())
                } else {
                    parsed
                }
            }
        };

        let assignment = Assignment {
            id: Uuid::new_v4().to_string(),
            config,
            targets: assigned_targets,
        };
        sqlx::query(
            r#"
            INSERT INTO job (id, queue_id, assignment, retval, time_start)
            VALUES (?1, ?2, ?3, NULL, ?4)
            "#,
        )
        .bind(&assignment.id)
        .bind(queue.id)
        .bind(serde_json::to_string(&assignment)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        info!("Created job {} for queue {} with {} targets", assignment.id, queue.name, assignment.targets.len());
        Ok(assignment)
    }

    /// Write back job results: output bytes to the job's output file,
    /// retval and end time to the job row.
    pub async fn finish(&self, job: &Job, retval: i64, output: &[u8]) -> Result<()> {
        let queue = self.queue_for(job).await?;
        let opath = Self::output_abspath(&queue, &job.id);
        if let Some(parent) = opath.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // write-then-rename keeps readers from seeing a torn output file
        let tmp = opath.with_extension("part");
        tokio::fs::write(&tmp, output).await?;
        tokio::fs::rename(&tmp, &opath).await?;

        sqlx::query("UPDATE job SET retval = ?1, time_end = ?2 WHERE id = ?3")
            .bind(retval)
            .bind(Utc::now())
            .bind(&job.id)
            .execute(&self.pool)
            .await?;

        info!("Job {} finished with retval {}", job.id, retval);
        Ok(())
    }

    /// Force-fail an orphaned job and reclaim its heatmap counts.
    ///
    /// A broken agent leaves jobs whose targets are still accounted in the
    /// heatmap; reconcile marks the job failed and drains them.
    pub async fn reconcile(&self, job: &Job) -> Result<()> {
        if job.is_terminal() {
            error!("Cannot reconcile completed job {}", job.id);
            return Err(SchedulerError::invalid_state(format!(
                "cannot reconcile completed job {}",
                job.id
            )));
        }

        let guard = self.lock.acquire(self.config.timeout_admin).await?;
        let result = self.reconcile_locked(job).await;
        guard.release().await;
        result
    }

    async fn reconcile_locked(&self, job: &Job) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE job SET retval = -1, time_end = ?1 WHERE id = ?2 AND retval IS NULL",
        )
        .bind(Utc::now())
        .bind(&job.id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(SchedulerError::invalid_state(format!(
                "cannot reconcile completed job {}",
                job.id
            )));
        }

        let assignment: Assignment = serde_json::from_str(&job.assignment)?;
        for target in &assignment.targets {
            heatmap::pop(
                &self.pool,
                self.config.heatmap_hot_level,
                self.config.heatmap_gc_probability,
                &hashval(target),
            )
            .await?;
        }

        warn!("Job {} reconciled, {} targets reclaimed", job.id, assignment.targets.len());
        Ok(())
    }

    /// Re-enqueue the job's targets.
    pub async fn repeat(&self, job: &Job) -> Result<()> {
        let assignment: Assignment = serde_json::from_str(&job.assignment)?;
        let queues = QueueManager::new(self.pool.clone(), Arc::clone(&self.config));
        let queue = queues.get(job.queue_id).await?;
        queues.enqueue(&queue, assignment.targets).await
    }

    /// Delete a terminal job and its output file.
    pub async fn delete(&self, job: &Job) -> Result<()> {
        // deleting a running job would corrupt the heatmap
        if !job.is_terminal() {
            error!("Cannot delete running job {}", job.id);
            return Err(SchedulerError::invalid_state(format!(
                "cannot delete running job {}",
                job.id
            )));
        }

        let queue = self.queue_for(job).await?;
        let opath = Self::output_abspath(&queue, &job.id);
        match tokio::fs::remove_file(&opath).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        sqlx::query("DELETE FROM job WHERE id = ?1")
            .bind(&job.id)
            .execute(&self.pool)
            .await?;

        debug!("Job {} deleted", job.id);
        Ok(())
    }

    async fn queue_for(&self, job: &Job) -> Result<Queue> {
        sqlx::query_as("SELECT * FROM queue WHERE id = ?1")
            .bind(job.queue_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SchedulerError::not_found(format!("queue {}", job.queue_id)))
    }
}
