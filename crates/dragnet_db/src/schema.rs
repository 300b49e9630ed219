//! Schema initialization for the scheduler relations.
//!
//! Five scheduler relations plus the lock lease row. `readynet` carries a
//! composite primary key on (queue_id, hashval); `target.hashval` is
//! indexed so bucket-scoped selection stays cheap on large queues.

use tracing::debug;

use crate::error::DbError;
use crate::pool::DbPool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        active INTEGER NOT NULL DEFAULT 1,
        priority INTEGER NOT NULL DEFAULT 0,
        group_size INTEGER NOT NULL DEFAULT 1,
        reqs TEXT NOT NULL DEFAULT '[]',
        config TEXT,
        data_abspath TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS target (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue_id INTEGER NOT NULL REFERENCES queue(id) ON DELETE CASCADE,
        target TEXT NOT NULL,
        hashval TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS target_queue_hashval ON target (queue_id, hashval)",
    "CREATE INDEX IF NOT EXISTS target_hashval ON target (hashval)",
    r#"
    CREATE TABLE IF NOT EXISTS readynet (
        queue_id INTEGER NOT NULL REFERENCES queue(id) ON DELETE CASCADE,
        hashval TEXT NOT NULL,
        PRIMARY KEY (queue_id, hashval)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS readynet_hashval ON readynet (hashval)",
    r#"
    CREATE TABLE IF NOT EXISTS heatmap (
        hashval TEXT PRIMARY KEY,
        count INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job (
        id TEXT PRIMARY KEY,
        queue_id INTEGER NOT NULL REFERENCES queue(id) ON DELETE CASCADE,
        assignment TEXT NOT NULL,
        retval INTEGER,
        time_start TEXT NOT NULL,
        time_end TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_lock (
        id INTEGER PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )
    "#,
];

/// Create all scheduler tables and indexes if they do not exist.
pub async fn init_schema(pool: &DbPool) -> Result<(), DbError> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("Scheduler schema initialized");
    Ok(())
}
