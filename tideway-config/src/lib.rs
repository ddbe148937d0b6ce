//! Loader for the cluster bootstrap file with JSON + environment overlays.
//!
//! The on-disk file (by default `static/lime_config.json`, the path the
//! collector/console stack was deployed against) and every console message
//! share the same envelope: a single `cluster` object. Values may contain
//! `${VAR}` placeholders, which are expanded after the `config` crate has
//! merged file and `TIDEWAY_`-prefixed environment sources.
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use tideway_common::JobTarget;

const MAXIMUM_ENV_EXPANSION_DEPTH: usize = 8;

/// The envelope every config source uses: `{"cluster": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterFile {
    pub cluster: ClusterConfig,
}

/// One managed Lustre cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Filesystem name, e.g. `lustrefs`. Discovery patterns and
    /// `jobid_var` tunables are derived from it.
    pub name: String,
    pub hosts: Vec<HostEntry>,
    #[serde(default)]
    pub ssh_identity_file: Option<String>,
    /// Rate policy selected at startup; the console can switch it later.
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(default)]
    pub fake_io: bool,
    #[serde(default)]
    pub jobs: Vec<JobTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub name: String,
}

fn default_policy() -> String {
    "priority".into()
}

fn expand_env_in_value(v: &mut Value) {
    match v {
        Value::String(s) => {
            if s.contains('$') {
                let mut cur = std::mem::take(s);
                for _ in 0..MAXIMUM_ENV_EXPANSION_DEPTH {
                    let expanded = match shellexpand::env(&cur) {
                        Ok(cow) => cow.into_owned(),
                        Err(_) => cur.clone(),
                    };
                    if expanded == cur {
                        break;
                    }
                    cur = expanded;
                }
                *s = cur;
            }
        }
        Value::Array(arr) => arr.iter_mut().for_each(expand_env_in_value),
        Value::Object(obj) => obj.values_mut().for_each(expand_env_in_value),
        _ => {}
    }
}

/// Builder hiding the `config` crate wiring (JSON file + env overrides).
pub struct ClusterConfigLoader {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl Default for ClusterConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterConfigLoader {
    /// Start with the defaults: a JSON file plus `TIDEWAY_` env overrides.
    pub fn new() -> Self {
        let builder =
            Config::builder().add_source(Environment::with_prefix("TIDEWAY").separator("__"));
        Self { builder }
    }

    /// Attach a config file; the `config` crate infers the format by suffix.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.builder = self
            .builder
            .add_source(File::from(path.as_ref()).required(true));
        self
    }

    /// Merge an inline JSON snippet (tests and CLI overrides).
    pub fn with_json_str(mut self, json: &str) -> Self {
        self.builder = self
            .builder
            .add_source(File::from_str(json, config::FileFormat::Json));
        self
    }

    /// Consume the builder and deserialize the merged sources.
    ///
    /// `${VAR}` placeholders are expanded before the strongly typed structs
    /// are materialised, so identity-file paths and host names can be
    /// parameterised per deployment.
    pub fn load(self) -> Result<ClusterConfig, ConfigError> {
        let cfg = self.builder.build()?;

        let mut v: Value = cfg.try_deserialize()?;
        expand_env_in_value(&mut v);

        let typed: ClusterFile =
            serde_json::from_value(v).map_err(|e| ConfigError::Message(e.to_string()))?;
        Ok(typed.cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expands_simple_string() {
        temp_env::with_var("TIDEWAY_TEST_FS", Some("seastore"), || {
            let mut v = json!("fs-${TIDEWAY_TEST_FS}");
            expand_env_in_value(&mut v);
            assert_eq!(v, json!("fs-seastore"));
        });
    }

    #[test]
    fn unknown_vars_are_left_as_is() {
        let mut v = json!("id-${TIDEWAY_DOES_NOT_EXIST}");
        expand_env_in_value(&mut v);
        assert_eq!(v, json!("id-${TIDEWAY_DOES_NOT_EXIST}"));
    }

    #[test]
    fn cluster_envelope_parses() {
        let raw = r#"{
            "cluster": {
                "name": "seastore",
                "hosts": [{"name": "oss0"}, {"name": "oss1"}],
                "ssh_identity_file": "/root/.ssh/id_rsa",
                "policy": "priority",
                "fake_io": true,
                "jobs": [{"job_id": "dd.0", "throughput": 1000}]
            }
        }"#;
        let file: ClusterFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.cluster.name, "seastore");
        assert_eq!(file.cluster.hosts.len(), 2);
        assert!(file.cluster.fake_io);
        assert_eq!(file.cluster.jobs[0].throughput, 1000);
    }

    #[test]
    fn optional_fields_default() {
        let raw = r#"{"cluster": {"name": "fs0", "hosts": []}}"#;
        let file: ClusterFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.cluster.policy, "priority");
        assert!(!file.cluster.fake_io);
        assert!(file.cluster.jobs.is_empty());
        assert!(file.cluster.ssh_identity_file.is_none());
    }

    #[test]
    fn non_integer_throughput_truncates() {
        let raw = r#"{"cluster": {"name": "fs0", "hosts": [],
                       "jobs": [{"job_id": "fio.7", "throughput": 512.7}]}}"#;
        let file: ClusterFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.cluster.jobs[0].throughput, 512);
    }
}
