use serial_test::serial;
use std::{fs, path::PathBuf};
use tempfile::TempDir;
use tideway_config::ClusterConfigLoader;

/// Helper to write a JSON file in a temp dir and return its path.
fn write_json(tmp: &TempDir, name: &str, json: &str) -> PathBuf {
    let p = tmp.path().join(name);
    fs::write(&p, json).expect("write json");
    p
}

#[test]
#[serial]
fn test_config_load() {
    let tmp = TempDir::new().unwrap();

    let file_json = r#"{
        "cluster": {
            "name": "seastore",
            "hosts": [
                {"name": "oss0.lab"},
                {"name": "oss1.lab"},
                {"name": "client0.lab"}
            ],
            "ssh_identity_file": "${HOME}/.ssh/id_rsa",
            "policy": "independent",
            "fake_io": false,
            "jobs": [
                {"job_id": "dd.0", "throughput": 2000},
                {"job_id": "dd.1", "throughput": 500}
            ]
        }
    }"#;
    let p = write_json(&tmp, "lime_config.json", file_json);

    let cluster = ClusterConfigLoader::new()
        .with_file(p)
        .load()
        .expect("load cluster config");

    assert_eq!(cluster.name, "seastore");
    assert_eq!(cluster.hosts.len(), 3);
    assert_eq!(cluster.policy, "independent");
    assert_eq!(cluster.jobs.len(), 2);
    // ${HOME} must have been expanded away.
    let identity = cluster.ssh_identity_file.unwrap();
    assert!(!identity.contains("${"));
}
