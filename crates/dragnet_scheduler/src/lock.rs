//! Process-wide scheduler lock.
//!
//! Every operation that mutates targets, readynets, or the heatmap is
//! serialized through a single leased database row, the portable stand-in
//! for a session-bound advisory lock. The lease carries a UUID holder token
//! and an expiry, so release can only free the holder's own claim and a
//! crashed holder is taken over once the lease runs out.

use std::time::Duration;

use chrono::Utc;
use dragnet_db::DbPool;
use tokio::time::{sleep, Instant};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// The single scheduler lock row.
const SCHEDULER_LOCK_ID: i64 = 1;
/// Lease validity; a holder gone longer than this is considered crashed.
const LEASE_DURATION: Duration = Duration::from_secs(60);
/// Claim retry interval while waiting.
const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Handle for acquiring the scheduler lock.
#[derive(Debug, Clone)]
pub struct SchedulerLock {
    pool: DbPool,
}

impl SchedulerLock {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Wait up to `timeout` for the lock.
    ///
    /// Both a passed deadline and a database failure during the claim
    /// surface as `SchedulerError::Busy`: a transient, retryable condition
    /// with nothing mutated yet.
    pub async fn acquire(&self, timeout: Duration) -> Result<LockGuard> {
        let holder = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;

        loop {
            match self.try_claim(&holder).await {
                Ok(true) => {
                    return Ok(LockGuard {
                        pool: self.pool.clone(),
                        holder,
                    });
                }
                Ok(false) => {}
                Err(err) => {
                    warn!("Failed to acquire scheduler lock: {err}");
                    return Err(SchedulerError::Busy);
                }
            }
            if Instant::now() >= deadline {
                warn!("Failed to acquire scheduler lock within {timeout:?}");
                return Err(SchedulerError::Busy);
            }
            sleep(RETRY_INTERVAL).await;
        }
    }

    async fn try_claim(&self, holder: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + LEASE_DURATION.as_millis() as i64;

        // insert claims a free lock; the conflict arm takes over expired leases
        let claimed = sqlx::query(
            r#"
            INSERT INTO scheduler_lock (id, holder, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (id) DO UPDATE
            SET holder = excluded.holder, expires_at = excluded.expires_at
            WHERE scheduler_lock.expires_at <= ?4
            "#,
        )
        .bind(SCHEDULER_LOCK_ID)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(claimed > 0)
    }
}

/// Held scheduler lock; must be released explicitly.
#[derive(Debug)]
pub struct LockGuard {
    pool: DbPool,
    holder: String,
}

impl LockGuard {
    /// Release the lock.
    ///
    /// A failed release is logged, not propagated: the lease expiry bounds
    /// how long the scheduler can stay wedged, and callers must not have
    /// their primary error masked by release noise.
    pub async fn release(self) {
        let result = sqlx::query("DELETE FROM scheduler_lock WHERE id = ?1 AND holder = ?2")
            .bind(SCHEDULER_LOCK_ID)
            .bind(&self.holder)
            .execute(&self.pool)
            .await;

        if let Err(err) = result {
            warn!("Failed to release scheduler lock: {err}");
        }
    }
}
