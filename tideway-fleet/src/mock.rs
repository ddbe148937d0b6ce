//! A recording fleet for tests: every command is appended to a log and
//! individual operations can be told to fail.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use tideway_common::{JobTarget, ServiceKind};

use crate::{FleetActuator, FleetError, HostServices, ServiceRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum FleetCommand {
    Discover,
    StartRule {
        name: String,
        jobid_expr: String,
        rate: u64,
    },
    StopRule {
        name: String,
    },
    ChangeRate {
        host: String,
        name: String,
        rate: u64,
    },
    EnableTbf {
        tbf_type: String,
    },
    EnableFifo,
    EnableFakeIo,
    ClearFakeIo,
    SetJobidVar {
        var: String,
    },
    CheckCpt,
    RestartCollector,
    StartIo {
        job_ids: Vec<String>,
    },
}

#[derive(Default)]
pub struct RecordingFleet {
    topology: Vec<HostServices>,
    commands: Mutex<Vec<FleetCommand>>,
    refused: Mutex<HashSet<&'static str>>,
}

impl RecordingFleet {
    pub fn new(topology: Vec<HostServices>) -> Self {
        Self {
            topology,
            ..Default::default()
        }
    }

    /// Shorthand topology: one entry per `(hostname, OST ids)` pair.
    pub fn with_osts(hosts: &[(&str, &[&str])]) -> Self {
        let topology = hosts
            .iter()
            .map(|(hostname, ost_ids)| HostServices {
                hostname: hostname.to_string(),
                services: ost_ids
                    .iter()
                    .map(|id| ServiceRecord {
                        kind: ServiceKind::Ost,
                        id: id.to_string(),
                        mount_point: None,
                    })
                    .collect(),
            })
            .collect();
        Self::new(topology)
    }

    /// Make every future call of `op` fail until [`allow`](Self::allow).
    pub fn refuse(&self, op: &'static str) {
        self.refused.lock().expect("refused lock").insert(op);
    }

    pub fn allow(&self, op: &'static str) {
        self.refused.lock().expect("refused lock").remove(op);
    }

    /// Snapshot of every recorded command, oldest first.
    pub fn commands(&self) -> Vec<FleetCommand> {
        self.commands.lock().expect("command lock").clone()
    }

    /// Drain the command log.
    pub fn take_commands(&self) -> Vec<FleetCommand> {
        std::mem::take(&mut *self.commands.lock().expect("command lock"))
    }

    fn record(&self, op: &'static str, command: FleetCommand) -> Result<(), FleetError> {
        if self.refused.lock().expect("refused lock").contains(op) {
            return Err(FleetError::Refused(op));
        }
        self.commands.lock().expect("command lock").push(command);
        Ok(())
    }
}

#[async_trait]
impl FleetActuator for RecordingFleet {
    async fn discover_services(&self) -> Result<Vec<HostServices>, FleetError> {
        self.record("discover_services", FleetCommand::Discover)?;
        Ok(self.topology.clone())
    }

    async fn start_rule(&self, name: &str, jobid_expr: &str, rate: u64) -> Result<(), FleetError> {
        self.record(
            "start_rule",
            FleetCommand::StartRule {
                name: name.to_string(),
                jobid_expr: jobid_expr.to_string(),
                rate,
            },
        )
    }

    async fn stop_rule(&self, name: &str) -> Result<(), FleetError> {
        self.record(
            "stop_rule",
            FleetCommand::StopRule {
                name: name.to_string(),
            },
        )
    }

    async fn change_rate(&self, host: &str, name: &str, rate: u64) -> Result<(), FleetError> {
        self.record(
            "change_rate",
            FleetCommand::ChangeRate {
                host: host.to_string(),
                name: name.to_string(),
                rate,
            },
        )
    }

    async fn enable_tbf(&self, tbf_type: &str) -> Result<(), FleetError> {
        self.record(
            "enable_tbf",
            FleetCommand::EnableTbf {
                tbf_type: tbf_type.to_string(),
            },
        )
    }

    async fn enable_fifo(&self) -> Result<(), FleetError> {
        self.record("enable_fifo", FleetCommand::EnableFifo)
    }

    async fn enable_fake_io(&self) -> Result<(), FleetError> {
        self.record("enable_fake_io", FleetCommand::EnableFakeIo)
    }

    async fn clear_fake_io(&self) -> Result<(), FleetError> {
        self.record("clear_fake_io", FleetCommand::ClearFakeIo)
    }

    async fn set_jobid_var(&self, var: &str) -> Result<(), FleetError> {
        self.record(
            "set_jobid_var",
            FleetCommand::SetJobidVar {
                var: var.to_string(),
            },
        )
    }

    async fn check_cpt(&self) -> Result<(), FleetError> {
        self.record("check_cpt", FleetCommand::CheckCpt)
    }

    async fn restart_collector(&self) -> Result<(), FleetError> {
        self.record("restart_collector", FleetCommand::RestartCollector)
    }

    async fn start_io(&self, jobs: &[JobTarget]) -> Result<(), FleetError> {
        self.record(
            "start_io",
            FleetCommand::StartIo {
                job_ids: jobs.iter().map(|j| j.job_id.clone()).collect(),
            },
        )
    }
}
