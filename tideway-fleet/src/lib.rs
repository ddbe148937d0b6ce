//! The fleet actuator surface: the command bus the controller drives.
//!
//! Every operation is synchronous from the caller's point of view, may
//! fail, and is never retried by the core. The [`SshFleet`] driver reaches
//! each server over `ssh` with short per-host timeouts; [`mock::RecordingFleet`]
//! stands in for it in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tideway_common::{JobTarget, ServiceKind};

pub mod mock;
pub mod ssh;

pub use ssh::SshFleet;

/// One service discovered on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub kind: ServiceKind,
    /// Stable identifier, e.g. `OST0001`. Metric samples reference it.
    pub id: String,
    /// Filesystem mount point; only set for client mounts.
    pub mount_point: Option<String>,
}

/// The services one host answered the discovery probe with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostServices {
    pub hostname: String,
    pub services: Vec<ServiceRecord>,
}

#[derive(thiserror::Error, Debug)]
pub enum FleetError {
    #[error("command [{command}] failed on host [{host}]: {stderr}")]
    Command {
        host: String,
        command: String,
        stderr: String,
    },

    #[error("could not reach host [{host}]: {source}")]
    Spawn {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command [{command}] timed out on host [{host}]")]
    Timeout { host: String, command: String },

    #[error("host [{host}] has cpu_npartitions [{value}], TBF needs exactly one CPT")]
    CpuPartitions { host: String, value: String },

    /// Injected by test doubles.
    #[error("fleet operation [{0}] refused")]
    Refused(&'static str),
}

/// The command surface the rate-control core consumes.
///
/// Rule start/stop and scheduler switches fan out to every OSS;
/// `change_rate` is the per-host knob the policies turn.
#[async_trait]
pub trait FleetActuator: Send + Sync {
    /// Enumerate the services hosted on each machine. Run once at startup.
    async fn discover_services(&self) -> Result<Vec<HostServices>, FleetError>;

    /// Start a TBF rule classifying `jobid_expr` at `rate` MB/s on every OSS.
    async fn start_rule(&self, name: &str, jobid_expr: &str, rate: u64) -> Result<(), FleetError>;

    /// Stop a TBF rule on every OSS.
    async fn stop_rule(&self, name: &str) -> Result<(), FleetError>;

    /// Re-program one rule's rate on one host.
    async fn change_rate(&self, host: &str, name: &str, rate: u64) -> Result<(), FleetError>;

    /// Switch the OST-IO scheduler to TBF with the given classifier.
    async fn enable_tbf(&self, tbf_type: &str) -> Result<(), FleetError>;

    /// Switch the OST-IO scheduler back to FIFO.
    async fn enable_fifo(&self) -> Result<(), FleetError>;

    /// Make every OSS acknowledge writes without touching disk.
    async fn enable_fake_io(&self) -> Result<(), FleetError>;

    /// Restore real I/O on every OSS.
    async fn clear_fake_io(&self) -> Result<(), FleetError>;

    /// Set the cluster-wide job classification variable.
    async fn set_jobid_var(&self, var: &str) -> Result<(), FleetError>;

    /// Verify every OSS runs a single CPU partition.
    async fn check_cpt(&self) -> Result<(), FleetError>;

    /// Restart the metric collector on every host.
    async fn restart_collector(&self) -> Result<(), FleetError>;

    /// Launch benchmark writers for the given jobs on client mounts.
    async fn start_io(&self, jobs: &[JobTarget]) -> Result<(), FleetError>;
}
