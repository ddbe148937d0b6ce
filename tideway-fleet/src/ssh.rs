//! SSH-backed fleet driver.
//!
//! One `ssh` invocation per command, `BatchMode` with a short connect
//! timeout so a single unreachable host cannot stall the tick loop for
//! long. Rule manipulation writes to the OST-IO procfs knobs; discovery
//! parses `lctl dl` and `/proc/mounts`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use tideway_common::JobTarget;
use tideway_common::ServiceKind;

use crate::{FleetActuator, FleetError, HostServices, ServiceRecord};

const NRS_RULE_KNOB: &str = "/proc/fs/lustre/ost/OSS/ost_io/nrs_tbf_rule";
const NRS_POLICY_KNOB: &str = "/proc/fs/lustre/ost/OSS/ost_io/nrs_policies";

/// Topology facts discovery fills in; later fan-out commands consult them.
#[derive(Debug, Default)]
struct Topology {
    oss_hosts: Vec<String>,
    mgs_host: Option<String>,
    client_mounts: Vec<(String, String)>,
    ost_count: usize,
}

pub struct SshFleet {
    fsname: String,
    hosts: Vec<String>,
    identity_file: Option<PathBuf>,
    connect_timeout: Duration,
    command_timeout: Duration,
    topology: Mutex<Topology>,
    ost_pattern: Regex,
    mdt_pattern: Regex,
    mgs_pattern: Regex,
    client_pattern: Regex,
}

impl SshFleet {
    pub fn new(fsname: &str, hosts: Vec<String>, identity_file: Option<PathBuf>) -> Self {
        let fs = regex::escape(fsname);
        let ost_pattern = Regex::new(&format!(r"^.+ UP obdfilter {fs}-OST(\S+) .+$"))
            .expect("static pattern");
        let mdt_pattern =
            Regex::new(&format!(r"^.+ UP mdt {fs}-MDT(\S+) .+$")).expect("static pattern");
        let mgs_pattern = Regex::new(r"^.+ UP mgs MGS MGS .+$").expect("static pattern");
        let client_pattern =
            Regex::new(&format!(r"^\S+:/{fs} (\S+) lustre .+$")).expect("static pattern");
        Self {
            fsname: fsname.to_string(),
            hosts,
            identity_file,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            topology: Mutex::new(Topology::default()),
            ost_pattern,
            mdt_pattern,
            mgs_pattern,
            client_pattern,
        }
    }

    /// Run one remote command, returning its stdout.
    async fn run(&self, host: &str, command: &str) -> Result<String, FleetError> {
        debug!(host, command, "fleet.run");
        let mut ssh = Command::new("ssh");
        ssh.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));
        if let Some(identity) = &self.identity_file {
            ssh.arg("-i").arg(identity);
        }
        ssh.arg(host)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.command_timeout, ssh.output())
            .await
            .map_err(|_| FleetError::Timeout {
                host: host.to_string(),
                command: command.to_string(),
            })?
            .map_err(|source| FleetError::Spawn {
                host: host.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(FleetError::Command {
                host: host.to_string(),
                command: command.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn oss_hosts(&self) -> Vec<String> {
        let topo = self.topology.lock().expect("topology lock");
        if topo.oss_hosts.is_empty() {
            self.hosts.clone()
        } else {
            topo.oss_hosts.clone()
        }
    }

    async fn run_on_oss(&self, command: &str) -> Result<(), FleetError> {
        for host in self.oss_hosts() {
            self.run(&host, command).await?;
        }
        Ok(())
    }

    async fn discover_host(&self, host: &str) -> Result<HostServices, FleetError> {
        let mut services = Vec::new();

        let listing = self.run(host, "lctl dl").await?;
        for line in listing.lines() {
            if let Some(caps) = self.ost_pattern.captures(line) {
                services.push(ServiceRecord {
                    kind: ServiceKind::Ost,
                    id: format!("OST{}", &caps[1]),
                    mount_point: None,
                });
            } else if let Some(caps) = self.mdt_pattern.captures(line) {
                services.push(ServiceRecord {
                    kind: ServiceKind::Mdt,
                    id: format!("MDT{}", &caps[1]),
                    mount_point: None,
                });
            } else if self.mgs_pattern.is_match(line) {
                services.push(ServiceRecord {
                    kind: ServiceKind::Mgs,
                    id: "MGS".to_string(),
                    mount_point: None,
                });
            }
        }

        let mounts = self.run(host, "cat /proc/mounts").await?;
        for line in mounts.lines() {
            if let Some(caps) = self.client_pattern.captures(line) {
                let mount = caps[1].to_string();
                services.push(ServiceRecord {
                    kind: ServiceKind::Client,
                    id: format!("{host}:{mount}"),
                    mount_point: Some(mount),
                });
            }
        }

        debug!(host, count = services.len(), "fleet.discover.host");
        Ok(HostServices {
            hostname: host.to_string(),
            services,
        })
    }
}

#[async_trait]
impl FleetActuator for SshFleet {
    async fn discover_services(&self) -> Result<Vec<HostServices>, FleetError> {
        let mut discovered = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            discovered.push(self.discover_host(host).await?);
        }

        let mut topo = Topology::default();
        for entry in &discovered {
            for service in &entry.services {
                match service.kind {
                    ServiceKind::Ost => {
                        topo.ost_count += 1;
                        if !topo.oss_hosts.contains(&entry.hostname) {
                            topo.oss_hosts.push(entry.hostname.clone());
                        }
                    }
                    ServiceKind::Mgs => topo.mgs_host = Some(entry.hostname.clone()),
                    ServiceKind::Client => {
                        if let Some(mount) = &service.mount_point {
                            topo.client_mounts
                                .push((entry.hostname.clone(), mount.clone()));
                        }
                    }
                    ServiceKind::Mdt => {}
                }
            }
        }
        info!(
            oss = topo.oss_hosts.len(),
            osts = topo.ost_count,
            clients = topo.client_mounts.len(),
            "fleet.discover.done"
        );
        *self.topology.lock().expect("topology lock") = topo;
        Ok(discovered)
    }

    // FIXME: servers older than 2.8.54 want the positional rule syntax
    // ("start <name> {<expr>} <rate>"); detect the version and fall back.
    async fn start_rule(&self, name: &str, jobid_expr: &str, rate: u64) -> Result<(), FleetError> {
        let command =
            format!("echo -n start {name} jobid={{{jobid_expr}}} rate={rate} > {NRS_RULE_KNOB}");
        self.run_on_oss(&command).await
    }

    async fn stop_rule(&self, name: &str) -> Result<(), FleetError> {
        let command = format!("echo -n stop {name} > {NRS_RULE_KNOB}");
        self.run_on_oss(&command).await
    }

    async fn change_rate(&self, host: &str, name: &str, rate: u64) -> Result<(), FleetError> {
        let command = format!("echo -n change {name} rate={rate} > {NRS_RULE_KNOB}");
        self.run(host, &command).await.map(|_| ())
    }

    async fn enable_tbf(&self, tbf_type: &str) -> Result<(), FleetError> {
        let command = format!("echo -n tbf {tbf_type} > {NRS_POLICY_KNOB}");
        self.run_on_oss(&command).await
    }

    async fn enable_fifo(&self) -> Result<(), FleetError> {
        let command = format!("echo -n fifo > {NRS_POLICY_KNOB}");
        self.run_on_oss(&command).await
    }

    async fn enable_fake_io(&self) -> Result<(), FleetError> {
        self.run_on_oss("lctl set_param fail_loc=0x238").await
    }

    async fn clear_fake_io(&self) -> Result<(), FleetError> {
        self.run_on_oss("lctl set_param fail_loc=0").await
    }

    async fn set_jobid_var(&self, var: &str) -> Result<(), FleetError> {
        let host = {
            let topo = self.topology.lock().expect("topology lock");
            topo.mgs_host
                .clone()
                .unwrap_or_else(|| self.hosts.first().cloned().unwrap_or_default())
        };
        let command = format!("lctl conf_param {}.sys.jobid_var={var}", self.fsname);
        self.run(&host, &command).await.map(|_| ())
    }

    async fn check_cpt(&self) -> Result<(), FleetError> {
        for host in self.oss_hosts() {
            let out = self
                .run(&host, "cat /sys/module/libcfs/parameters/cpu_npartitions")
                .await?;
            let value = out.trim().to_string();
            if value != "1" {
                return Err(FleetError::CpuPartitions { host, value });
            }
        }
        Ok(())
    }

    async fn restart_collector(&self) -> Result<(), FleetError> {
        for host in &self.hosts {
            // A wedged collector can hang `service restart` forever, so any
            // stale process is killed first.
            let pid = self
                .run(
                    host,
                    "ps aux | grep /usr/sbin/collectd | grep -v grep | awk '{print $2}'",
                )
                .await?;
            let pid = pid.trim();
            if !pid.is_empty() {
                self.run(host, &format!("kill -9 {pid}")).await?;
            }
            self.run(host, "service collectd restart").await?;
        }
        Ok(())
    }

    async fn start_io(&self, jobs: &[JobTarget]) -> Result<(), FleetError> {
        let (client_mounts, ost_count) = {
            let topo = self.topology.lock().expect("topology lock");
            (topo.client_mounts.clone(), topo.ost_count)
        };
        if jobs.len() > client_mounts.len() {
            warn!(
                jobs = jobs.len(),
                clients = client_mounts.len(),
                "fleet.start_io.not_enough_clients"
            );
            return Err(FleetError::Refused("start_io"));
        }

        // Writers from a previous run hold the mounts open; evict them.
        for (host, mount) in &client_mounts {
            if let Err(error) = self.run(host, &format!("fuser -km {mount}")).await {
                debug!(host, %error, "fleet.start_io.fuser");
            }
        }

        for (job, (host, mount)) in jobs.iter().zip(client_mounts.iter()) {
            let fname = format!("{mount}/tideway_io_{}", tideway_common::escape_rule_name(&job.job_id));
            self.run(host, &format!("rm -f {fname}")).await?;
            if ost_count > 0 {
                self.run(host, &format!("lfs setstripe -c {ost_count} {fname}"))
                    .await?;
            }
            self.run(host, &format!("chmod 777 {fname}")).await?;
            let writer = format!(
                "nohup bash -c 'while :; do dd if=/dev/zero of={fname} bs=1M; done' \
                 >/dev/null 2>&1 &"
            );
            self.run(host, &writer).await?;
            info!(host, job_id = %job.job_id, "fleet.start_io.writer");
        }
        Ok(())
    }
}
