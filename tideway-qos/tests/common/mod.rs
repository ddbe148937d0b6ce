use std::sync::Arc;

use tideway_common::JobTarget;
use tideway_config::ClusterConfig;
use tideway_fleet::mock::{FleetCommand, RecordingFleet};
use tideway_fleet::{HostServices, ServiceRecord};
use tideway_qos::{ServiceRegistry, SessionRegistry};

pub struct Harness {
    pub session: SessionRegistry,
    pub fleet: Arc<RecordingFleet>,
}

pub fn topology(hosts: &[(&str, &[&str])]) -> Vec<HostServices> {
    hosts
        .iter()
        .map(|(hostname, ost_ids)| HostServices {
            hostname: hostname.to_string(),
            services: ost_ids
                .iter()
                .map(|id| ServiceRecord {
                    kind: tideway_common::ServiceKind::Ost,
                    id: id.to_string(),
                    mount_point: None,
                })
                .collect(),
        })
        .collect()
}

pub fn harness(policy: &str, hosts: &[(&str, &[&str])]) -> Harness {
    let topo = topology(hosts);
    let fleet = Arc::new(RecordingFleet::new(topo.clone()));
    let registry = Arc::new(ServiceRegistry::from_discovery(topo).expect("clean topology"));
    let session = SessionRegistry::new(registry, fleet.clone(), policy, false);
    Harness { session, fleet }
}

pub fn cluster(policy: &str, fake_io: bool, jobs: &[(&str, u64)]) -> ClusterConfig {
    ClusterConfig {
        name: "seastore".to_string(),
        hosts: Vec::new(),
        ssh_identity_file: None,
        policy: policy.to_string(),
        fake_io,
        jobs: jobs
            .iter()
            .map(|(job_id, throughput)| JobTarget {
                job_id: job_id.to_string(),
                throughput: *throughput,
            })
            .collect(),
    }
}

/// Every `change_rate` issued for `rule`, oldest first, as (host, rate).
pub fn rate_changes(fleet: &RecordingFleet, rule: &str) -> Vec<(String, u64)> {
    fleet
        .commands()
        .into_iter()
        .filter_map(|c| match c {
            FleetCommand::ChangeRate { host, name, rate } if name == rule => Some((host, rate)),
            _ => None,
        })
        .collect()
}
