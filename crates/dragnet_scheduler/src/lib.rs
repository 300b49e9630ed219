//! Rate-limited target scheduler.
//!
//! Operators enqueue target strings into named queues; remote agents poll
//! for work and receive assignments sized to the queue's `group_size`. A
//! per-bucket heatmap counts assigned-but-unfinished targets so that no
//! network is probed too densely at once, and the readynet index keeps
//! random target selection cheap: instead of joining every candidate
//! against the heatmap on each draw, the scheduler maintains the set of
//! (queue, bucket) pairs that currently hold pickable targets and draws
//! from it with two indexed random picks.

pub mod config;
pub mod error;
pub mod excl;
mod heatmap;
pub mod jobs;
pub mod lock;
pub mod net;
pub mod queues;
pub mod service;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use excl::{ExclEntry, ExclFamily, ExclMatcher};
pub use jobs::{Assignment, JobManager};
pub use lock::{LockGuard, SchedulerLock};
pub use net::{enumerate_network, hashval};
pub use queues::{QueueDecl, QueueManager};
pub use service::{RandomTarget, SchedulerService};
