//! Rate-limited assignment service.
//!
//! A naive take on rate-limited random selection (targets joined against
//! the heatmap on every draw, or a full target re-scan in the worst case)
//! degrades badly with queue size. The scheduler instead maintains the
//! readynet index — the set of (queue, bucket) pairs that currently hold
//! pickable targets in cool buckets — so one draw is two indexed random
//! picks, and the heatmap transitions keep the index current.

use std::collections::BTreeSet;
use std::sync::Arc;

use dragnet_db::{DbPool, Queue};
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::excl::ExclMatcher;
use crate::heatmap;
use crate::jobs::{Assignment, JobManager};
use crate::lock::SchedulerLock;
use crate::net::hashval;

/// A target popped from a queue along with its rate-limit bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomTarget {
    pub id: i64,
    pub target: String,
    pub hashval: String,
}

/// The assignment/return protocol against the shared scheduler state.
#[derive(Debug, Clone)]
pub struct SchedulerService {
    pool: DbPool,
    config: Arc<SchedulerConfig>,
    excl: ExclMatcher,
    lock: SchedulerLock,
}

impl SchedulerService {
    pub fn new(pool: DbPool, config: Arc<SchedulerConfig>, excl: ExclMatcher) -> Self {
        let lock = SchedulerLock::new(pool.clone());
        Self {
            pool,
            config,
            excl,
            lock,
        }
    }

    /// Build the service with exclusions loaded per the configuration.
    pub fn from_config(pool: DbPool, config: Arc<SchedulerConfig>) -> Result<Self> {
        let excl = ExclMatcher::from_config(&config)?;
        Ok(Self::new(pool, config, excl))
    }

    /// Account a target into the heatmap; returns the new bucket count.
    pub async fn heatmap_put(&self, hashval: &str) -> Result<i64> {
        heatmap::put(&self.pool, self.config.heatmap_hot_level, hashval).await
    }

    /// Drain a target from the heatmap; returns the new bucket count.
    pub async fn heatmap_pop(&self, hashval: &str) -> Result<i64> {
        heatmap::pop(
            &self.pool,
            self.config.heatmap_hot_level,
            self.config.heatmap_gc_probability,
            hashval,
        )
        .await
    }

    /// The subset of the given buckets currently at rate limit.
    pub async fn grep_hot_hashvals(&self, hashvals: &BTreeSet<String>) -> Result<Vec<String>> {
        heatmap::grep_hot(&self.pool, self.config.heatmap_hot_level, hashvals).await
    }

    /// Select a queue for assignment honoring the client's constraints.
    ///
    /// The queue must be active, have at least one cool bucket with
    /// enqueued targets, require no capability the client lacks, and match
    /// the requested name when one is given. Highest priority wins, ties
    /// break at random inside the database.
    async fn assignment_queue(
        &self,
        queue_name: Option<&str>,
        client_caps: &[String],
    ) -> Result<Option<Queue>> {
        let candidates: Vec<Queue> = if let Some(name) = queue_name {
            sqlx::query_as(
                r#"
                SELECT * FROM queue
                WHERE active = 1 AND name = ?1
                  AND id IN (SELECT DISTINCT queue_id FROM readynet)
                ORDER BY priority DESC, RANDOM()
                "#,
            )
            .bind(name)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                SELECT * FROM queue
                WHERE active = 1
                  AND id IN (SELECT DISTINCT queue_id FROM readynet)
                ORDER BY priority DESC, RANDOM()
                "#,
            )
            .fetch_all(&self.pool)
            .await?
        };

        for queue in candidates {
            let reqs = queue.reqs_list()?;
            if reqs.iter().all(|req| client_caps.contains(req)) {
                return Ok(Some(queue));
            }
        }
        Ok(None)
    }

    /// Pop one random target from a random cool bucket of the queue,
    /// pruning the bucket's readynet row when the queue exhausts it.
    async fn pop_random_target(&self, queue: &Queue) -> Result<Option<RandomTarget>> {
        let mut tx = self.pool.begin().await?;

        let bucket: Option<String> = sqlx::query_scalar(
            "SELECT hashval FROM readynet WHERE queue_id = ?1 ORDER BY RANDOM() LIMIT 1",
        )
        .bind(queue.id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(bucket) = bucket else {
            tx.commit().await?;
            return Ok(None);
        };

        let (target_id, target): (i64, String) = sqlx::query_as(
            r#"
            SELECT id, target FROM target
            WHERE queue_id = ?1 AND hashval = ?2
            ORDER BY RANDOM() LIMIT 1
            "#,
        )
        .bind(queue.id)
        .bind(&bucket)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM target WHERE id = ?1")
            .bind(target_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            DELETE FROM readynet
            WHERE queue_id = ?1 AND hashval = ?2
              AND NOT EXISTS (
                  SELECT 1 FROM target WHERE queue_id = ?1 AND hashval = ?2
              )
            "#,
        )
        .bind(queue.id)
        .bind(&bucket)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(RandomTarget {
            id: target_id,
            target,
            hashval: bucket,
        }))
    }

    /// Assign work to an agent; `None` means nowork.
    ///
    /// Draws up to `group_size` targets from the selected queue, accounting
    /// each into the heatmap. Excluded targets are discarded silently:
    /// their row is already popped and they neither bump the heatmap nor
    /// consume an assignment slot.
    pub async fn job_assign(
        &self,
        queue_name: Option<&str>,
        client_caps: &[String],
    ) -> Result<Option<Assignment>> {
        let guard = self.lock.acquire(self.config.timeout_job_assign).await?;
        let result = self.job_assign_locked(queue_name, client_caps).await;
        guard.release().await;
        result
    }

    async fn job_assign_locked(
        &self,
        queue_name: Option<&str>,
        client_caps: &[String],
    ) -> Result<Option<Assignment>> {
        let Some(queue) = self.assignment_queue(queue_name, client_caps).await? else {
            debug!("No assignable queue");
            return Ok(None);
        };

        let mut assigned_targets: Vec<String> = Vec::new();
        while (assigned_targets.len() as i64) < queue.group_size {
            let Some(rtarget) = self.pop_random_target(&queue).await? else {
                break;
            };
            if self.excl.match_target(&rtarget.target) {
                debug!("Discarding excluded target {}", rtarget.target);
                continue;
            }
            assigned_targets.push(rtarget.target);
            heatmap::put(&self.pool, self.config.heatmap_hot_level, &rtarget.hashval).await?;
        }

        if assigned_targets.is_empty() {
            return Ok(None);
        }
        let jobs = JobManager::new(self.pool.clone(), Arc::clone(&self.config));
        let assignment = jobs.create(&queue, assigned_targets).await?;
        info!("Assigned job {} from queue {} with {} targets", assignment.id, queue.name, assignment.targets.len());
        Ok(Some(assignment))
    }

    /// Receive output from an assigned job and drain its heatmap counts.
    pub async fn job_output(&self, job_id: &str, retval: i64, output: &[u8]) -> Result<()> {
        let guard = self.lock.acquire(self.config.timeout_job_output).await?;
        let result = self.job_output_locked(job_id, retval, output).await;
        guard.release().await;
        result
    }

    async fn job_output_locked(&self, job_id: &str, retval: i64, output: &[u8]) -> Result<()> {
        let jobs = JobManager::new(self.pool.clone(), Arc::clone(&self.config));
        let job = jobs.get(job_id).await?;
        // a duplicate submission must not drain the heatmap twice
        if job.is_terminal() {
            return Err(SchedulerError::invalid_state(format!(
                "job {job_id} already completed"
            )));
        }

        jobs.finish(&job, retval, output).await?;
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
        Ok(())
    }
}
