//! Common types and constants shared across Tideway crates.
//!
//! This crate defines the rate-control constants, the service taxonomy,
//! TBF rule-name escaping, observability helpers, and shared error types
//! used throughout the Tideway workspace. It is intentionally lightweight
//! and dependency-minimal so that all crates can depend on it without
//! introducing heavy transitive costs.
//!
//! # Overview
//!
//! - [`MIN_RATE_LIMIT`] / [`DEFAULT_RATE_LIMIT`] / [`METRIC_INTERVAL`]:
//!   the controller's fixed operating bounds
//! - [`ServiceKind`]: the kinds of filesystem actors a host can run
//! - [`escape_rule_name`]: job id to TBF rule name mapping
//! - [`observability`]: centralised tracing/logging initialisation
//! - [`TidewayError`] and [`Result`]: shared error handling
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod observability;

/// Lowest per-host rate limit the controller will ever program, in MB/s.
pub const MIN_RATE_LIMIT: u64 = 10;

/// Rate limit a freshly created TBF rule starts at, in MB/s. Also the
/// ceiling every per-host limit is clamped to.
pub const DEFAULT_RATE_LIMIT: u64 = 10000;

/// Period of the broadcast-reap-tune loop.
pub const METRIC_INTERVAL: Duration = Duration::from_secs(1);

/// The kinds of services a cluster host can run. Only OSTs are
/// rate-limited; the others matter for discovery and bootstrap checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceKind {
    Ost,
    Mdt,
    Mgs,
    Client,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Ost => "OST",
            ServiceKind::Mdt => "MDT",
            ServiceKind::Mgs => "MGS",
            ServiceKind::Client => "CLIENT",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operator-declared throughput target for one job, as it appears both
/// in the bootstrap config file and in console messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTarget {
    pub job_id: String,
    /// Target rate in MB/s. Non-integer input is truncated on the wire.
    #[serde(deserialize_with = "de_trunc_u64")]
    pub throughput: u64,
}

fn de_trunc_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    if raw < 0.0 {
        return Err(serde::de::Error::custom("throughput must be non-negative"));
    }
    Ok(raw.trunc() as u64)
}

/// A valid TBF rule name is alphanumerics and `_` only; every other
/// character of the job id is replaced by `_`. Alphanumeric is the
/// Unicode class, so non-Latin job ids keep their letters.
pub fn escape_rule_name(job_id: &str) -> String {
    job_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Error types used across the Tideway system.
#[derive(thiserror::Error, Debug)]
pub enum TidewayError {
    /// Configuration was incomplete or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cluster setup or discovery produced an unusable topology.
    #[error("cluster setup failed: {0}")]
    Setup(String),

    /// A lower layer reported an error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenient alias for results that use [`TidewayError`].
pub type Result<T> = std::result::Result<T, TidewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_passes_valid_characters() {
        assert_eq!(escape_rule_name("job_01"), "job_01");
        assert_eq!(escape_rule_name("ABCxyz9"), "ABCxyz9");
    }

    #[test]
    fn escape_keeps_non_ascii_alphanumerics() {
        assert_eq!(escape_rule_name("émile.1"), "émile_1");
        assert_eq!(escape_rule_name("作业-2"), "作业_2");
    }

    #[test]
    fn escape_replaces_everything_else() {
        assert_eq!(escape_rule_name("dd.0"), "dd_0");
        assert_eq!(escape_rule_name("a-b c:d"), "a_b_c_d");
        assert_eq!(escape_rule_name(""), "");
    }

    #[test]
    fn job_target_truncates_fractional_throughput() {
        let t: JobTarget =
            serde_json::from_str(r#"{"job_id":"dd.0","throughput":1000.9}"#).unwrap();
        assert_eq!(t.throughput, 1000);
    }

    #[test]
    fn job_target_accepts_integers() {
        let t: JobTarget = serde_json::from_str(r#"{"job_id":"dd.0","throughput":500}"#).unwrap();
        assert_eq!(t.throughput, 500);
    }
}
