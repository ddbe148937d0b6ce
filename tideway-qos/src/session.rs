//! Session registry: the single-writer façade every inbound path goes
//! through. Consoles watch and unwatch jobs, the collector routes samples,
//! the operator pushes config, and the tick loop drives the
//! broadcast → reap → tune pass. Callers hold one mutex around the whole
//! registry; nothing in here spawns or locks.

use std::sync::Arc;

use anyhow::{bail, Result};
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tideway_common::DEFAULT_RATE_LIMIT;
use tideway_config::ClusterConfig;
use tideway_fleet::FleetActuator;

use crate::job::JobWatch;
use crate::policy::{independent::IndependentPolicy, priority::PriorityPolicy, RatePolicy};
use crate::proto::ConsoleReply;
use crate::registry::ServiceRegistry;

/// Where one console's outbound frames go. A failed send marks the
/// console dead; it is garbage-collected at the end of the tick.
#[derive(Clone)]
pub struct ConsoleSink {
    id: Uuid,
    tx: mpsc::UnboundedSender<ConsoleReply>,
}

impl ConsoleSink {
    pub fn new(tx: mpsc::UnboundedSender<ConsoleReply>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    /// Sink plus the receiving half, for handlers and tests.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConsoleReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn send(
        &self,
        reply: ConsoleReply,
    ) -> std::result::Result<(), mpsc::error::SendError<ConsoleReply>> {
        self.tx.send(reply)
    }
}

/// The watched jobs in priority order plus the handles policies need to
/// act on them. Split out of [`SessionRegistry`] so a policy can borrow
/// the table mutably while it is itself borrowed from the registry.
pub struct JobTable {
    jobs: IndexMap<String, JobWatch>,
    registry: Arc<ServiceRegistry>,
    fleet: Arc<dyn FleetActuator>,
}

impl JobTable {
    pub fn new(registry: Arc<ServiceRegistry>, fleet: Arc<dyn FleetActuator>) -> Self {
        Self {
            jobs: IndexMap::new(),
            registry,
            fleet,
        }
    }

    pub fn fleet(&self) -> Arc<dyn FleetActuator> {
        self.fleet.clone()
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn job(&self, job_id: &str) -> Option<&JobWatch> {
        self.jobs.get(job_id)
    }

    pub fn job_mut(&mut self, job_id: &str) -> Option<&mut JobWatch> {
        self.jobs.get_mut(job_id)
    }

    /// Jobs in insertion order; the position *is* the priority.
    pub fn jobs(&self) -> impl Iterator<Item = (&String, &JobWatch)> {
        self.jobs.iter()
    }

    pub fn jobs_mut(&mut self) -> impl Iterator<Item = (&String, &mut JobWatch)> {
        self.jobs.iter_mut()
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub(crate) fn insert(&mut self, job: JobWatch) {
        self.jobs.insert(job.job_id().to_string(), job);
    }

    /// Remove preserving the order of the remaining jobs. A swap-remove
    /// would silently re-rank priorities.
    pub(crate) fn remove(&mut self, job_id: &str) -> Option<JobWatch> {
        self.jobs.shift_remove(job_id)
    }

    /// Immutable capture of aggregate rates from the head of the priority
    /// order up to and including `subject`, always including `actor`.
    pub fn save_rates(&self, subject: &str, actor: &str) -> IndexMap<String, f64> {
        let mut rates = IndexMap::new();
        for (job_id, job) in &self.jobs {
            rates.insert(job_id.clone(), job.rate());
            if job_id == subject {
                break;
            }
        }
        if !rates.contains_key(actor) {
            if let Some(job) = self.jobs.get(actor) {
                rates.insert(actor.to_string(), job.rate());
            }
        }
        rates
    }

    /// Program one job's rule on one host; used by action records where
    /// the acting job may differ from the subject.
    pub async fn change_job_host_rate(
        &mut self,
        job_id: &str,
        hostname: &str,
        rate: u64,
    ) -> Result<()> {
        let fleet = self.fleet.clone();
        let Some(job) = self.jobs.get_mut(job_id) else {
            bail!("job [{job_id}] is no longer watched");
        };
        if job.host(hostname).is_none() {
            bail!("job [{job_id}] has no state on host [{hostname}]");
        }
        job.change_host_rate(fleet.as_ref(), hostname, rate).await
    }
}

/// All watched jobs plus the active policy and the fake-I/O mirror.
pub struct SessionRegistry {
    table: JobTable,
    policies: Vec<Box<dyn RatePolicy>>,
    current_policy: usize,
    fake_io: bool,
}

impl SessionRegistry {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        fleet: Arc<dyn FleetActuator>,
        policy_name: &str,
        fake_io: bool,
    ) -> Self {
        let policies: Vec<Box<dyn RatePolicy>> = vec![
            Box::new(IndependentPolicy::new()),
            Box::new(PriorityPolicy::new()),
        ];
        let current_policy = policies
            .iter()
            .position(|p| p.name() == policy_name)
            .unwrap_or_else(|| {
                warn!(policy_name, "unknown policy at startup, using priority");
                1
            });
        Self {
            table: JobTable::new(registry, fleet),
            policies,
            current_policy,
            fake_io,
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policies[self.current_policy].name()
    }

    pub fn fake_io(&self) -> bool {
        self.fake_io
    }

    pub fn table(&self) -> &JobTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut JobTable {
        &mut self.table
    }

    /// Attach a console to a job, creating the job (and its TBF rule) on
    /// first watch. A failed rule start is logged; the job is still
    /// created so telemetry and later retunes can proceed.
    pub async fn watch(&mut self, job_id: &str, sink: ConsoleSink) {
        if self.table.job(job_id).is_none() {
            let job = JobWatch::new(job_id);
            info!(job_id, rule = job.rule_name(), "watching new job");
            if let Err(error) = self
                .table
                .fleet()
                .start_rule(job.rule_name(), job_id, DEFAULT_RATE_LIMIT)
                .await
            {
                error!(job_id, %error, "failed to start TBF rule");
            }
            self.table.insert(job);
        }
        if let Some(job) = self.table.job_mut(job_id) {
            job.subscribe(sink);
        }
    }

    /// Detach a console; the last subscriber leaving stops the rule and
    /// drops the job.
    pub async fn unwatch(&mut self, job_id: &str, console_id: Uuid) {
        let Some(job) = self.table.job_mut(job_id) else {
            return;
        };
        job.unsubscribe(console_id);
        if job.subscriber_count() == 0 {
            self.stop_and_remove(job_id).await;
        }
    }

    /// Route one counter sample. Returns `false` when the job is not
    /// watched (the sample is dropped).
    pub fn on_metric(&mut self, service_id: &str, job_id: &str, ts: f64, value: f64) -> bool {
        let registry = self.table.registry.clone();
        match self.table.job_mut(job_id) {
            Some(job) => {
                job.ingest(&registry, service_id, ts, value);
                true
            }
            None => false,
        }
    }

    /// Apply an operator configuration message: policy selection, fake-I/O
    /// toggle, per-job target rates.
    pub async fn update_config(&mut self, cluster: &ClusterConfig) -> Result<()> {
        if self.policy_name() != cluster.policy {
            match self
                .policies
                .iter()
                .position(|p| p.name() == cluster.policy)
            {
                Some(index) => {
                    info!(from = self.policy_name(), to = %cluster.policy, "changing policy");
                    self.policies[self.current_policy].reset();
                    self.current_policy = index;
                }
                None => warn!(policy = %cluster.policy, "unknown policy requested, keeping current"),
            }
        }

        if cluster.fake_io != self.fake_io {
            info!(fake_io = cluster.fake_io, "changing fake I/O");
            let fleet = self.table.fleet();
            let toggled = if cluster.fake_io {
                fleet.enable_fake_io().await
            } else {
                fleet.clear_fake_io().await
            };
            match toggled {
                Ok(()) => self.fake_io = cluster.fake_io,
                Err(error) => error!(%error, "failed to toggle fake I/O"),
            }
        }

        for target in &cluster.jobs {
            match self.table.job_mut(&target.job_id) {
                Some(job) => job.set_rate_limit(Some(target.throughput)),
                None => {
                    debug!(job_id = %target.job_id, "target rate for unwatched job ignored")
                }
            }
        }
        Ok(())
    }

    /// One scheduler pass: broadcast a datapoint per job, reap jobs whose
    /// last console died, then let the active policy take one step.
    pub async fn tick(&mut self) {
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let mut reaped = Vec::new();
        for (job_id, job) in self.table.jobs_mut() {
            let rate = job.recompute_rate();
            job.broadcast(&ConsoleReply::Datapoint {
                time: now,
                rate,
                job_id: job_id.clone(),
            });
            if job.subscriber_count() == 0 {
                reaped.push(job_id.clone());
            }
        }
        for job_id in reaped {
            self.stop_and_remove(&job_id).await;
        }

        let policy = &mut self.policies[self.current_policy];
        if let Err(error) = policy.tune(&mut self.table).await {
            warn!(%error, "policy step failed");
        }
    }

    async fn stop_and_remove(&mut self, job_id: &str) {
        let Some(job) = self.table.remove(job_id) else {
            return;
        };
        info!(job_id, "dropping job without subscribers");
        if let Err(error) = self.table.fleet().stop_rule(job.rule_name()).await {
            error!(job_id, %error, "failed to stop TBF rule");
        }
    }
}
