//! Database layer for the dragnet scheduler.
//!
//! Uses a concrete `SqlitePool` rather than `sqlx::AnyPool`, which allows
//! full support for `#[derive(FromRow)]` with custom types like
//! `DateTime<Utc>`.

pub mod error;
pub mod models;
pub mod pool;
pub mod schema;

pub use error::DbError;
pub use models::{HeatmapEntry, Job, Queue, Readynet, Target};
pub use pool::{create_pool, DbConfig, DbPool};
pub use schema::init_schema;
