//! Cluster preparation at startup. Every step here is fatal on failure:
//! a half-prepared fleet would let the controller issue rule changes
//! against schedulers that never saw them.

use anyhow::{Context, Result};
use tracing::info;

use tideway_config::ClusterConfig;
use tideway_fleet::FleetActuator;
use tideway_qos::ServiceRegistry;

pub async fn bootstrap(fleet: &dyn FleetActuator, cluster: &ClusterConfig) -> Result<ServiceRegistry> {
    info!(cluster = %cluster.name, "detecting services");
    let registry = ServiceRegistry::detect(fleet)
        .await
        .context("service discovery failed")?;

    fleet
        .restart_collector()
        .await
        .context("collector restart failed")?;

    if cluster.fake_io {
        fleet
            .enable_fake_io()
            .await
            .context("enabling fake I/O failed")?;
    } else {
        fleet
            .clear_fake_io()
            .await
            .context("clearing fake I/O failed")?;
    }

    fleet.check_cpt().await.context("CPT check failed")?;

    // Reset the OST-IO scheduler to FIFO before switching so TBF starts
    // from a clean rule table.
    fleet
        .enable_fifo()
        .await
        .context("switching to FIFO failed")?;
    fleet
        .enable_tbf("jobid")
        .await
        .context("switching to TBF failed")?;
    fleet
        .set_jobid_var("procname_uid")
        .await
        .context("setting jobid_var failed")?;

    if !cluster.jobs.is_empty() {
        fleet
            .start_io(&cluster.jobs)
            .await
            .context("starting benchmark I/O failed")?;
    }

    info!("cluster ready");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tideway_common::JobTarget;
    use tideway_fleet::mock::{FleetCommand, RecordingFleet};

    fn cluster(fake_io: bool, jobs: Vec<JobTarget>) -> ClusterConfig {
        ClusterConfig {
            name: "seastore".into(),
            hosts: Vec::new(),
            ssh_identity_file: None,
            policy: "priority".into(),
            fake_io,
            jobs,
        }
    }

    #[tokio::test]
    async fn runs_the_preparation_sequence_in_order() {
        let fleet = RecordingFleet::with_osts(&[("oss0", &["OST0000"])]);
        let cfg = cluster(
            true,
            vec![JobTarget {
                job_id: "dd.0".into(),
                throughput: 1000,
            }],
        );
        bootstrap(&fleet, &cfg).await.unwrap();
        assert_eq!(
            fleet.commands(),
            vec![
                FleetCommand::Discover,
                FleetCommand::RestartCollector,
                FleetCommand::EnableFakeIo,
                FleetCommand::CheckCpt,
                FleetCommand::EnableFifo,
                FleetCommand::EnableTbf {
                    tbf_type: "jobid".into()
                },
                FleetCommand::SetJobidVar {
                    var: "procname_uid".into()
                },
                FleetCommand::StartIo {
                    job_ids: vec!["dd.0".into()]
                },
            ]
        );
    }

    #[tokio::test]
    async fn real_io_clears_the_fail_loc_and_skips_writers() {
        let fleet = RecordingFleet::with_osts(&[("oss0", &["OST0000"])]);
        bootstrap(&fleet, &cluster(false, Vec::new())).await.unwrap();
        let commands = fleet.commands();
        assert!(commands.contains(&FleetCommand::ClearFakeIo));
        assert!(!commands
            .iter()
            .any(|c| matches!(c, FleetCommand::StartIo { .. })));
    }

    #[tokio::test]
    async fn startup_actuator_failure_is_fatal() {
        let fleet = RecordingFleet::with_osts(&[("oss0", &["OST0000"])]);
        fleet.refuse("enable_tbf");
        assert!(bootstrap(&fleet, &cluster(false, Vec::new())).await.is_err());
    }
}
