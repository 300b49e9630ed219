//! Process-wide scheduler configuration.
//!
//! Defaults are overridable through `DRAGNET_*` environment variables so
//! deployments can tune rate limiting without a config file.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Heatmap count at or above which a bucket is hot and unpickable.
    pub heatmap_hot_level: i64,
    /// Lock wait for agent assignment requests.
    pub timeout_job_assign: Duration,
    /// Lock wait for agent output submission.
    pub timeout_job_output: Duration,
    /// Lock wait for operator paths (enqueue, flush, delete, reconcile).
    pub timeout_admin: Duration,
    /// Probability of garbage-collecting count-0 heatmap rows on pop.
    pub heatmap_gc_probability: f64,
    /// YAML exclusion pattern file; no file means nothing is excluded.
    pub excl_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heatmap_hot_level: 10,
            timeout_job_assign: Duration::from_secs(3),
            timeout_job_output: Duration::from_secs(30),
            timeout_admin: Duration::from_secs(30),
            heatmap_gc_probability: 0.1,
            excl_path: None,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overlaid with any `DRAGNET_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(level) = parse_var::<i64>("DRAGNET_HEATMAP_HOT_LEVEL") {
            config.heatmap_hot_level = level;
        }
        if let Some(secs) = parse_var::<u64>("DRAGNET_TIMEOUT_JOB_ASSIGN") {
            config.timeout_job_assign = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("DRAGNET_TIMEOUT_JOB_OUTPUT") {
            config.timeout_job_output = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("DRAGNET_TIMEOUT_ADMIN") {
            config.timeout_admin = Duration::from_secs(secs);
        }
        if let Some(probability) = parse_var::<f64>("DRAGNET_HEATMAP_GC_PROBABILITY") {
            config.heatmap_gc_probability = probability;
        }
        if let Ok(path) = env::var("DRAGNET_EXCL_FILE") {
            config.excl_path = Some(PathBuf::from(path));
        }
        config
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable {name}={raw}");
            None
        }
    }
}
