//! Queue lifecycle and population.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dragnet_db::{DbPool, Queue};
use sqlx::{QueryBuilder, Sqlite};
use tracing::info;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::heatmap;
use crate::jobs::JobManager;
use crate::lock::SchedulerLock;
use crate::net::hashval;

/// Rows per multi-row insert, kept under SQLite's bind variable limit.
const ENQUEUE_CHUNK: usize = 300;

/// Operator-supplied queue fields.
#[derive(Debug, Clone)]
pub struct QueueDecl {
    pub name: String,
    pub active: bool,
    pub priority: i64,
    pub group_size: i64,
    pub reqs: Vec<String>,
    pub config: Option<String>,
    pub data_abspath: PathBuf,
}

/// Governs queues, readynets and targets.
#[derive(Debug, Clone)]
pub struct QueueManager {
    pool: DbPool,
    config: Arc<SchedulerConfig>,
    lock: SchedulerLock,
}

impl QueueManager {
    pub fn new(pool: DbPool, config: Arc<SchedulerConfig>) -> Self {
        let lock = SchedulerLock::new(pool.clone());
        Self { pool, config, lock }
    }

    /// Create a queue.
    pub async fn add(&self, decl: &QueueDecl) -> Result<Queue> {
        let reqs = serde_json::to_string(&decl.reqs)?;
        let data_abspath = decl.data_abspath.to_string_lossy().into_owned();
        let result = sqlx::query(
            r#"
            INSERT INTO queue (name, active, priority, group_size, reqs, config, data_abspath)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&decl.name)
        .bind(decl.active)
        .bind(decl.priority)
        .bind(decl.group_size)
        .bind(&reqs)
        .bind(&decl.config)
        .bind(data_abspath)
        .execute(&self.pool)
        .await?;

        info!("Queue {} created", decl.name);
        self.get(result.last_insert_rowid()).await
    }

    /// Fetch a queue by id.
    pub async fn get(&self, queue_id: i64) -> Result<Queue> {
        sqlx::query_as("SELECT * FROM queue WHERE id = ?1")
            .bind(queue_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SchedulerError::not_found(format!("queue {queue_id}")))
    }

    /// Fetch a queue by name.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Queue>> {
        let queue = sqlx::query_as("SELECT * FROM queue WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(queue)
    }

    /// Enqueue targets to a queue.
    ///
    /// Targets are trimmed and empties dropped. Buckets already at the rate
    /// limit get no readynet row here; they are re-activated when the
    /// bucket cools.
    pub async fn enqueue<I, S>(&self, queue: &Queue, targets: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pending: Vec<(String, String)> = Vec::new();
        let mut buckets: BTreeSet<String> = BTreeSet::new();
        for raw in targets {
            let target = raw.as_ref().trim();
            if target.is_empty() {
                continue;
            }
            let bucket = hashval(target);
            buckets.insert(bucket.clone());
            pending.push((target.to_string(), bucket));
        }
        if pending.is_empty() {
            return Ok(());
        }

        let guard = self.lock.acquire(self.config.timeout_admin).await?;
        let result = self.enqueue_locked(queue, &pending, &buckets).await;
        guard.release().await;
        result
    }

    async fn enqueue_locked(
        &self,
        queue: &Queue,
        pending: &[(String, String)],
        buckets: &BTreeSet<String>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in pending.chunks(ENQUEUE_CHUNK) {
            let mut insert: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO target (queue_id, target, hashval) ");
            insert.push_values(chunk, |mut row, (target, bucket)| {
                row.push_bind(queue.id).push_bind(target).push_bind(bucket);
            });
            insert.build().execute(&mut *tx).await?;
        }

        let hot: BTreeSet<String> =
            heatmap::grep_hot(&mut *tx, self.config.heatmap_hot_level, buckets)
                .await?
                .into_iter()
                .collect();
        for bucket in buckets.difference(&hot) {
            sqlx::query(
                r#"
                INSERT INTO readynet (queue_id, hashval) VALUES (?1, ?2)
                ON CONFLICT (queue_id, hashval) DO NOTHING
                "#,
            )
            .bind(queue.id)
            .bind(bucket)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!("Enqueued {} targets to queue {}", pending.len(), queue.name);
        Ok(())
    }

    /// Flush all targets from a queue. Jobs and the heatmap are untouched.
    pub async fn flush(&self, queue: &Queue) -> Result<()> {
        let guard = self.lock.acquire(self.config.timeout_admin).await?;
        let result = self.flush_locked(queue).await;
        guard.release().await;
        result
    }

    async fn flush_locked(&self, queue: &Queue) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM target WHERE queue_id = ?1")
            .bind(queue.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM readynet WHERE queue_id = ?1")
            .bind(queue.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Queue {} flushed, {} targets dropped", queue.name, removed);
        Ok(())
    }

    /// Delete every job belonging to the queue.
    ///
    /// A still-running job aborts the prune; deleting it would corrupt the
    /// heatmap.
    pub async fn prune(&self, queue: &Queue) -> Result<()> {
        let jobs = JobManager::new(self.pool.clone(), Arc::clone(&self.config));
        for job in jobs.list_for_queue(queue.id).await? {
            jobs.delete(&job).await?;
        }
        Ok(())
    }

    /// Delete a queue, its jobs (with output files), targets and readynets.
    pub async fn delete(&self, queue: &Queue) -> Result<()> {
        self.prune(queue).await?;

        // prune emptied the output directory
        match tokio::fs::remove_dir(Path::new(&queue.data_abspath)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let guard = self.lock.acquire(self.config.timeout_admin).await?;
        let result = self.delete_locked(queue).await;
        guard.release().await;
        result
    }

    async fn delete_locked(&self, queue: &Queue) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM readynet WHERE queue_id = ?1")
            .bind(queue.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM target WHERE queue_id = ?1")
            .bind(queue.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM queue WHERE id = ?1")
            .bind(queue.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Queue {} deleted", queue.name);
        Ok(())
    }
}
