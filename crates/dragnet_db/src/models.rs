//! Row models for the scheduler relations.
//!
//! Uses derive macros for FromRow to map database rows to structs. List
//! valued columns (queue capability requirements) are stored as JSON text
//! and parsed on access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A named queue of pending targets.
///
/// `reqs` holds the capability tags an agent must offer as a JSON array;
/// `config` is passed to the agent verbatim (YAML text); `data_abspath` is
/// the directory job outputs are written under.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Queue {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub priority: i64,
    pub group_size: i64,
    pub reqs: String,
    pub config: Option<String>,
    pub data_abspath: String,
}

impl Queue {
    /// Parse the JSON `reqs` column into the capability tag list.
    pub fn reqs_list(&self) -> Result<Vec<String>, serde_json::Error> {
        serde_json::from_str(&self.reqs)
    }
}

/// A single enqueued target string with its precomputed rate-limit bucket.
#[derive(Debug, Clone, FromRow)]
pub struct Target {
    pub id: i64,
    pub queue_id: i64,
    pub target: String,
    pub hashval: String,
}

/// Marker that a queue has at least one pickable target in a cool bucket.
#[derive(Debug, Clone, FromRow)]
pub struct Readynet {
    pub queue_id: i64,
    pub hashval: String,
}

/// Outstanding-target counter for one rate-limit bucket.
#[derive(Debug, Clone, FromRow)]
pub struct HeatmapEntry {
    pub hashval: String,
    pub count: i64,
}

/// A unit of work handed to one agent.
///
/// `retval` is null while the job is outstanding; any value marks the job
/// terminal (-1 for reconciled jobs).
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub id: String,
    pub queue_id: i64,
    pub assignment: String,
    pub retval: Option<i64>,
    pub time_start: DateTime<Utc>,
    pub time_end: Option<DateTime<Utc>>,
}

impl Job {
    /// Terminal jobs have drained their heatmap contribution exactly once.
    pub fn is_terminal(&self) -> bool {
        self.retval.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_fixture(reqs: &str) -> Queue {
        Queue {
            id: 1,
            name: "sweep".to_string(),
            active: true,
            priority: 0,
            group_size: 10,
            reqs: reqs.to_string(),
            config: None,
            data_abspath: "/tmp/sweep".to_string(),
        }
    }

    #[test]
    fn test_reqs_list_parses_json_array() {
        let queue = queue_fixture(r#"["nmap","ipv6"]"#);
        assert_eq!(queue.reqs_list().unwrap(), vec!["nmap", "ipv6"]);
        assert!(queue_fixture("[]").reqs_list().unwrap().is_empty());
    }

    #[test]
    fn test_reqs_list_rejects_garbage() {
        assert!(queue_fixture("not json").reqs_list().is_err());
    }

    #[test]
    fn test_job_terminal() {
        let mut job = Job {
            id: "a".to_string(),
            queue_id: 1,
            assignment: "{}".to_string(),
            retval: None,
            time_start: Utc::now(),
            time_end: None,
        };
        assert!(!job.is_terminal());
        job.retval = Some(-1);
        assert!(job.is_terminal());
    }
}
