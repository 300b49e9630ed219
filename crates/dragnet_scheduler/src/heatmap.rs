//! Heatmap accounting.
//!
//! The heatmap counts assigned-but-unfinished targets per rate-limit
//! bucket. Crossing the hot threshold retires the bucket's readynet rows
//! everywhere; cooling back below it re-activates them for every queue
//! still holding targets in the bucket. Count-0 rows are garbage-collected
//! opportunistically to amortize the cleanup cost.

use std::collections::BTreeSet;

use dragnet_db::DbPool;
use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

use crate::error::Result;

/// Increment a bucket's counter, retiring its readynets when it goes hot.
/// Returns the new count.
pub(crate) async fn put(pool: &DbPool, hot_level: i64, hashval: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO heatmap (hashval, count) VALUES (?1, 1)
        ON CONFLICT (hashval) DO UPDATE SET count = count + 1
        RETURNING count
        "#,
    )
    .bind(hashval)
    .fetch_one(pool)
    .await?;

    if count >= hot_level {
        sqlx::query("DELETE FROM readynet WHERE hashval = ?1")
            .bind(hashval)
            .execute(pool)
            .await?;
        debug!("Bucket {} hot at {}, readynets retired", hashval, count);
    }

    Ok(count)
}

/// Decrement a bucket's counter, re-activating readynets when it cools
/// back below the hot threshold. Returns the new count.
pub(crate) async fn pop(
    pool: &DbPool,
    hot_level: i64,
    gc_probability: f64,
    hashval: &str,
) -> Result<i64> {
    // the insert arm is unreachable while puts and pops stay paired, but
    // keeps the statement a single upsert
    let count: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO heatmap (hashval, count) VALUES (?1, 1)
        ON CONFLICT (hashval) DO UPDATE SET count = count - 1
        RETURNING count
        "#,
    )
    .bind(hashval)
    .fetch_one(pool)
    .await?;

    if rand::random::<f64>() < gc_probability {
        sqlx::query("DELETE FROM heatmap WHERE count = 0")
            .execute(pool)
            .await?;
    }

    if count + 1 == hot_level {
        let queue_ids: Vec<i64> =
            sqlx::query_scalar("SELECT DISTINCT queue_id FROM target WHERE hashval = ?1")
                .bind(hashval)
                .fetch_all(pool)
                .await?;
        for queue_id in queue_ids {
            sqlx::query(
                r#"
                INSERT INTO readynet (queue_id, hashval) VALUES (?1, ?2)
                ON CONFLICT (queue_id, hashval) DO NOTHING
                "#,
            )
            .bind(queue_id)
            .bind(hashval)
            .execute(pool)
            .await?;
        }
        debug!("Bucket {} cooled to {}", hashval, count);
    }

    Ok(count)
}

/// Filter the given buckets down to the ones currently at or above the hot
/// threshold.
pub(crate) async fn grep_hot<'e, E>(
    executor: E,
    hot_level: i64,
    hashvals: &BTreeSet<String>,
) -> Result<Vec<String>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    if hashvals.is_empty() {
        return Ok(Vec::new());
    }

    let mut query: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT hashval FROM heatmap WHERE count >= ");
    query.push_bind(hot_level);
    query.push(" AND hashval IN (");
    {
        let mut values = query.separated(", ");
        for hashval in hashvals {
            values.push_bind(hashval);
        }
        values.push_unseparated(")");
    }

    let hot = query
        .build_query_scalar::<String>()
        .fetch_all(executor)
        .await?;
    Ok(hot)
}
