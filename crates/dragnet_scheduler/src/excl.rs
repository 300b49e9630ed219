//! Exclusion matcher.
//!
//! Operator-configured patterns that cause selected targets to be discarded
//! at assignment time without counting against rate limits. Two pattern
//! families: `network` (address or CIDR containment/overlap) and `regex`
//! (raw target string, typically hostnames).
//!
//! The pattern file is a YAML list:
//!
//! ```yaml
//! - family: network
//!   value: 203.0.113.0/24
//! - family: regex
//!   value: '.*\.donotscan\.example$'
//! ```

use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::error::Result;

/// Exclusion pattern family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclFamily {
    Network,
    Regex,
}

/// One entry of the exclusion pattern file.
#[derive(Debug, Clone, Deserialize)]
pub struct ExclEntry {
    pub family: ExclFamily,
    pub value: String,
}

#[derive(Debug, Clone)]
enum ExclPattern {
    Network(IpNet),
    Regex(Regex),
}

/// Compiled exclusion pattern set with a pure match predicate.
#[derive(Debug, Clone, Default)]
pub struct ExclMatcher {
    patterns: Vec<ExclPattern>,
}

impl ExclMatcher {
    /// A matcher that excludes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile a pattern list.
    pub fn new(entries: &[ExclEntry]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(entries.len());
        for entry in entries {
            let pattern = match entry.family {
                ExclFamily::Network => ExclPattern::Network(parse_net(&entry.value)?),
                ExclFamily::Regex => ExclPattern::Regex(Regex::new(&entry.value)?),
            };
            patterns.push(pattern);
        }
        Ok(Self { patterns })
    }

    /// Load and compile a YAML pattern file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<ExclEntry> = serde_yaml::from_str(&raw)?;
        let matcher = Self::new(&entries)?;
        info!("Loaded {} exclusion patterns from {}", matcher.patterns.len(), path.display());
        Ok(matcher)
    }

    /// Load the matcher named by the configuration, or an empty one.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        match &config.excl_path {
            Some(path) => Self::load(path),
            None => Ok(Self::empty()),
        }
    }

    /// Does any pattern match the target string?
    pub fn match_target(&self, target: &str) -> bool {
        let addr = target.parse::<IpAddr>().ok();
        let net = match addr {
            Some(_) => None,
            None => target.parse::<IpNet>().ok(),
        };

        self.patterns.iter().any(|pattern| match pattern {
            ExclPattern::Network(excl) => match (&addr, &net) {
                (Some(addr), _) => excl.contains(addr),
                (None, Some(net)) => excl.contains(&net.network()) || net.contains(&excl.network()),
                (None, None) => false,
            },
            ExclPattern::Regex(regex) => regex.is_match(target),
        })
    }
}

fn parse_net(value: &str) -> Result<IpNet> {
    match value.parse::<IpNet>() {
        Ok(net) => Ok(net.trunc()),
        Err(_) => Ok(IpNet::from(value.parse::<IpAddr>()?)),
    }
}
