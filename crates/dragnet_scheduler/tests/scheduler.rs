//! End-to-end scheduler tests: rate-limited assignment, output returns,
//! reconcile, exclusions, and the derived-state invariants that tie the
//! heatmap and readynet index together.

use std::sync::Arc;
use std::time::Duration;

use dragnet_db::{create_pool, init_schema, DbConfig, DbPool, Queue};
use dragnet_scheduler::{
    hashval, Assignment, ExclEntry, ExclFamily, ExclMatcher, JobManager, QueueDecl, QueueManager,
    SchedulerConfig, SchedulerError, SchedulerLock, SchedulerService,
};
use tempfile::TempDir;

struct Harness {
    pool: DbPool,
    config: Arc<SchedulerConfig>,
    queues: QueueManager,
    jobs: JobManager,
    service: SchedulerService,
    tmp: TempDir,
}

async fn setup(hot_level: i64, excl: ExclMatcher) -> Harness {
    let pool = create_pool(&DbConfig::sqlite_memory()).await.unwrap();
    init_schema(&pool).await.unwrap();
    let config = Arc::new(SchedulerConfig {
        heatmap_hot_level: hot_level,
        heatmap_gc_probability: 0.0,
        ..SchedulerConfig::default()
    });
    Harness {
        pool: pool.clone(),
        config: Arc::clone(&config),
        queues: QueueManager::new(pool.clone(), Arc::clone(&config)),
        jobs: JobManager::new(pool.clone(), Arc::clone(&config)),
        service: SchedulerService::new(pool, config, excl),
        tmp: TempDir::new().unwrap(),
    }
}

impl Harness {
    async fn add_queue(&self, name: &str, priority: i64, group_size: i64, reqs: &[&str]) -> Queue {
        self.queues
            .add(&QueueDecl {
                name: name.to_string(),
                active: true,
                priority,
                group_size,
                reqs: reqs.iter().map(|s| s.to_string()).collect(),
                config: Some("module: scan".to_string()),
                data_abspath: self.tmp.path().join(name),
            })
            .await
            .unwrap()
    }

    async fn count(&self, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(&self.pool).await.unwrap()
    }

    async fn heat(&self, bucket: &str) -> i64 {
        sqlx::query_scalar("SELECT COALESCE(SUM(count), 0) FROM heatmap WHERE hashval = ?1")
            .bind(bucket)
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    /// Readynet soundness and completeness against the current heatmap.
    async fn assert_readynet_invariants(&self) {
        // soundness: every readynet row has a live target and a cool bucket
        let unsound: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM readynet r
            WHERE NOT EXISTS (
                SELECT 1 FROM target t
                WHERE t.queue_id = r.queue_id AND t.hashval = r.hashval
            )
            OR COALESCE((SELECT count FROM heatmap h WHERE h.hashval = r.hashval), 0) >= ?1
            "#,
        )
        .bind(self.config.heatmap_hot_level)
        .fetch_one(&self.pool)
        .await
        .unwrap();
        assert_eq!(unsound, 0, "readynet rows for empty or hot buckets");

        // completeness: every cool bucket with targets is represented
        let missing: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (SELECT DISTINCT queue_id, hashval FROM target) t
            WHERE COALESCE((SELECT count FROM heatmap h WHERE h.hashval = t.hashval), 0) < ?1
              AND NOT EXISTS (
                  SELECT 1 FROM readynet r
                  WHERE r.queue_id = t.queue_id AND r.hashval = t.hashval
              )
            "#,
        )
        .bind(self.config.heatmap_hot_level)
        .fetch_one(&self.pool)
        .await
        .unwrap();
        assert_eq!(missing, 0, "cool buckets with targets missing a readynet");
    }

    /// Heatmap conservation: counts equal outstanding targets of running jobs.
    async fn assert_heatmap_conservation(&self) {
        let mut expected: std::collections::BTreeMap<String, i64> = Default::default();
        let rows: Vec<(String, Option<i64>)> =
            sqlx::query_as("SELECT assignment, retval FROM job")
                .fetch_all(&self.pool)
                .await
                .unwrap();
        for (assignment, retval) in rows {
            if retval.is_some() {
                continue;
            }
            let assignment: Assignment = serde_json::from_str(&assignment).unwrap();
            for target in &assignment.targets {
                *expected.entry(hashval(target)).or_default() += 1;
            }
        }

        let actual: Vec<(String, i64)> =
            sqlx::query_as("SELECT hashval, count FROM heatmap WHERE count > 0")
                .fetch_all(&self.pool)
                .await
                .unwrap();
        let actual: std::collections::BTreeMap<String, i64> = actual.into_iter().collect();
        assert_eq!(actual, expected, "heatmap counts drifted from running jobs");
    }
}

#[tokio::test]
async fn test_rate_limited_assignment_per_bucket() {
    let harness = setup(2, ExclMatcher::empty()).await;
    let queue = harness.add_queue("sweep", 0, 10, &[]).await;
    harness
        .queues
        .enqueue(&queue, ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.1.1"])
        .await
        .unwrap();

    // at most hot_level targets of one /24 may be in flight at once
    let assignment = harness.service.job_assign(None, &[]).await.unwrap().unwrap();
    assert_eq!(assignment.targets.len(), 3);
    let dense = assignment
        .targets
        .iter()
        .filter(|t| t.starts_with("10.0.0."))
        .count();
    assert_eq!(dense, 2);
    assert!(assignment.targets.contains(&"10.0.1.1".to_string()));
    assert_eq!(harness.heat("10.0.0.0/24").await, 2);
    harness.assert_readynet_invariants().await;
    harness.assert_heatmap_conservation().await;

    // the remaining 10.0.0.* target is pinned behind the hot bucket
    assert!(harness.service.job_assign(None, &[]).await.unwrap().is_none());
    assert_eq!(harness.count("SELECT COUNT(*) FROM target").await, 1);

    // output cools the bucket and releases the held-back target
    harness
        .service
        .job_output(&assignment.id, 0, b"output")
        .await
        .unwrap();
    assert_eq!(harness.heat("10.0.0.0/24").await, 0);
    harness.assert_readynet_invariants().await;

    let followup = harness.service.job_assign(None, &[]).await.unwrap().unwrap();
    assert_eq!(followup.targets.len(), 1);
    assert!(followup.targets[0].starts_with("10.0.0."));
}

#[tokio::test]
async fn test_nowork_on_empty_queue() {
    let harness = setup(10, ExclMatcher::empty()).await;
    harness.add_queue("sweep", 0, 10, &[]).await;

    assert!(harness.service.job_assign(None, &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_capability_mismatch_yields_nowork() {
    let harness = setup(10, ExclMatcher::empty()).await;
    let queue = harness.add_queue("sweep", 0, 10, &["nmap"]).await;
    harness.queues.enqueue(&queue, ["10.0.0.1"]).await.unwrap();

    let assignment = harness
        .service
        .job_assign(None, &["dirbuster".to_string()])
        .await
        .unwrap();
    assert!(assignment.is_none());
    assert_eq!(harness.count("SELECT COUNT(*) FROM target").await, 1);
}

#[tokio::test]
async fn test_priority_queue_drained_first() {
    let harness = setup(10, ExclMatcher::empty()).await;
    let high = harness.add_queue("high", 10, 1, &[]).await;
    let low = harness.add_queue("low", 5, 1, &[]).await;
    harness
        .queues
        .enqueue(&high, ["10.0.0.1", "10.1.0.1", "10.2.0.1"])
        .await
        .unwrap();
    harness
        .queues
        .enqueue(&low, ["10.3.0.1", "10.4.0.1", "10.5.0.1"])
        .await
        .unwrap();

    for _ in 0..3 {
        harness.service.job_assign(None, &[]).await.unwrap().unwrap();
    }

    let high_left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM target WHERE queue_id = ?1")
        .bind(high.id)
        .fetch_one(&harness.pool)
        .await
        .unwrap();
    let low_left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM target WHERE queue_id = ?1")
        .bind(low.id)
        .fetch_one(&harness.pool)
        .await
        .unwrap();
    assert_eq!(high_left, 0);
    assert_eq!(low_left, 3);

    // with the high queue exhausted the low queue is next
    harness.service.job_assign(None, &[]).await.unwrap().unwrap();
    let low_left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM target WHERE queue_id = ?1")
        .bind(low.id)
        .fetch_one(&harness.pool)
        .await
        .unwrap();
    assert_eq!(low_left, 2);
}

#[tokio::test]
async fn test_reconcile_reclaims_heatmap() {
    let harness = setup(10, ExclMatcher::empty()).await;
    let queue = harness.add_queue("sweep", 0, 10, &[]).await;
    harness
        .queues
        .enqueue(&queue, ["192.0.2.1", "192.0.2.2", "192.0.2.3"])
        .await
        .unwrap();

    let assignment = harness.service.job_assign(None, &[]).await.unwrap().unwrap();
    assert_eq!(assignment.targets.len(), 3);
    assert_eq!(harness.heat("192.0.2.0/24").await, 3);

    let job = harness.jobs.get(&assignment.id).await.unwrap();
    harness.jobs.reconcile(&job).await.unwrap();

    let job = harness.jobs.get(&assignment.id).await.unwrap();
    assert_eq!(job.retval, Some(-1));
    assert_eq!(harness.heat("192.0.2.0/24").await, 0);
    harness.assert_heatmap_conservation().await;

    // reconciled targets are not re-enqueued automatically
    assert_eq!(harness.count("SELECT COUNT(*) FROM target").await, 0);

    // but an explicit repeat brings them back
    harness.jobs.repeat(&job).await.unwrap();
    assert_eq!(harness.count("SELECT COUNT(*) FROM target").await, 3);
    harness.assert_readynet_invariants().await;
}

#[tokio::test]
async fn test_excluded_targets_dropped_silently() {
    let excl = ExclMatcher::new(&[ExclEntry {
        family: ExclFamily::Network,
        value: "203.0.113.0/24".to_string(),
    }])
    .unwrap();
    let harness = setup(10, excl).await;
    let queue = harness.add_queue("sweep", 0, 10, &[]).await;
    harness
        .queues
        .enqueue(&queue, ["203.0.113.5", "198.51.100.5"])
        .await
        .unwrap();

    let assignment = harness.service.job_assign(None, &[]).await.unwrap().unwrap();
    assert_eq!(assignment.targets, vec!["198.51.100.5"]);

    // dropped, not re-enqueued, and never accounted
    assert_eq!(harness.count("SELECT COUNT(*) FROM target").await, 0);
    assert_eq!(harness.heat("203.0.113.0/24").await, 0);
    assert_eq!(harness.heat("198.51.100.0/24").await, 1);
}

#[tokio::test]
async fn test_round_trip_drains_all_state() {
    let harness = setup(2, ExclMatcher::empty()).await;
    let queue = harness.add_queue("sweep", 0, 3, &[]).await;
    let targets: Vec<String> = (0..4)
        .flat_map(|net| (1..=4).map(move |host| format!("10.0.{net}.{host}")))
        .collect();
    harness.queues.enqueue(&queue, &targets).await.unwrap();
    assert_eq!(harness.count("SELECT COUNT(*) FROM target").await, 16);

    let mut assigned_total = 0;
    loop {
        let Some(assignment) = harness.service.job_assign(None, &[]).await.unwrap() else {
            break;
        };
        assert!(assignment.targets.len() <= 3);
        assigned_total += assignment.targets.len();
        harness.assert_heatmap_conservation().await;
        harness.assert_readynet_invariants().await;
        harness
            .service
            .job_output(&assignment.id, 0, b"done")
            .await
            .unwrap();
    }

    assert_eq!(assigned_total, 16);
    assert_eq!(harness.count("SELECT COUNT(*) FROM target").await, 0);
    assert_eq!(harness.count("SELECT COUNT(*) FROM readynet").await, 0);
    assert_eq!(
        harness.count("SELECT COALESCE(SUM(count), 0) FROM heatmap").await,
        0
    );
    harness.assert_heatmap_conservation().await;
}

#[tokio::test]
async fn test_busy_lock_surfaces_as_transient_error() {
    let pool = create_pool(&DbConfig::sqlite_memory()).await.unwrap();
    init_schema(&pool).await.unwrap();
    let config = Arc::new(SchedulerConfig {
        timeout_job_assign: Duration::from_millis(50),
        ..SchedulerConfig::default()
    });
    let service = SchedulerService::new(pool.clone(), config, ExclMatcher::empty());

    let lock = SchedulerLock::new(pool);
    let guard = lock.acquire(Duration::from_secs(1)).await.unwrap();

    let err = service.job_assign(None, &[]).await;
    assert!(matches!(err, Err(SchedulerError::Busy)));

    guard.release().await;
    assert!(service.job_assign(None, &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_queue_prune_refuses_running_jobs() {
    let harness = setup(10, ExclMatcher::empty()).await;
    let queue = harness.add_queue("sweep", 0, 10, &[]).await;
    harness.queues.enqueue(&queue, ["10.0.0.1"]).await.unwrap();

    let assignment = harness.service.job_assign(None, &[]).await.unwrap().unwrap();
    let err = harness.queues.prune(&queue).await;
    assert!(matches!(err, Err(SchedulerError::InvalidState(_))));

    harness
        .service
        .job_output(&assignment.id, 0, b"out")
        .await
        .unwrap();
    harness.queues.prune(&queue).await.unwrap();
    assert_eq!(harness.count("SELECT COUNT(*) FROM job").await, 0);

    // queue delete removes the emptied output directory and the queue row
    harness.queues.delete(&queue).await.unwrap();
    assert_eq!(harness.count("SELECT COUNT(*) FROM queue").await, 0);
    assert!(!harness.tmp.path().join("sweep").exists());
}
