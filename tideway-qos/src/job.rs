//! Per-job bookkeeping: which hosts and services feed a job, what each
//! host is programmed to, and the deadband self-tuning helpers.

use std::collections::HashMap;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use tideway_common::{escape_rule_name, DEFAULT_RATE_LIMIT, MIN_RATE_LIMIT};
use tideway_fleet::FleetActuator;

use crate::flow::ServiceFlow;
use crate::registry::ServiceRegistry;
use crate::session::ConsoleSink;

/// One host's contribution to one job.
#[derive(Debug)]
pub struct HostFlow {
    hostname: String,
    service_ids: Vec<String>,
    /// Programmed TBF limit for this job on this host, MB/s.
    rate_limit: u64,
    /// Observed MB/s, refreshed each tick.
    rate: f64,
}

impl HostFlow {
    fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            service_ids: Vec::new(),
            rate_limit: DEFAULT_RATE_LIMIT,
            rate: 0.0,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn rate_limit(&self) -> u64 {
        self.rate_limit
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

/// All state for one watched job.
pub struct JobWatch {
    job_id: String,
    rule_name: String,
    subscribers: Vec<ConsoleSink>,
    services: HashMap<String, ServiceFlow>,
    hosts: IndexMap<String, HostFlow>,
    /// Operator-declared target, if any.
    rate_limit: Option<u64>,
    /// What was last fanned out to the fleet; differs from `rate_limit`
    /// until a policy applies a fresh operator target.
    current_rate_limit: Option<u64>,
    rate: f64,
}

impl JobWatch {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            rule_name: escape_rule_name(job_id),
            subscribers: Vec::new(),
            services: HashMap::new(),
            hosts: IndexMap::new(),
            rate_limit: None,
            current_rate_limit: None,
            rate: 0.0,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn rate_limit(&self) -> Option<u64> {
        self.rate_limit
    }

    pub fn set_rate_limit(&mut self, limit: Option<u64>) {
        self.rate_limit = limit;
    }

    pub fn current_rate_limit(&self) -> Option<u64> {
        self.current_rate_limit
    }

    pub fn set_current_rate_limit(&mut self, limit: Option<u64>) {
        self.current_rate_limit = limit;
    }

    pub fn hosts(&self) -> &IndexMap<String, HostFlow> {
        &self.hosts
    }

    pub fn host(&self, hostname: &str) -> Option<&HostFlow> {
        self.hosts.get(hostname)
    }

    // ---- subscribers ------------------------------------------------------

    pub fn subscribe(&mut self, sink: ConsoleSink) {
        self.subscribers.push(sink);
    }

    pub fn unsubscribe(&mut self, console_id: uuid::Uuid) {
        self.subscribers.retain(|s| s.id() != console_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Send one frame to every subscriber, dropping the ones whose
    /// transport has died.
    pub fn broadcast(&mut self, reply: &crate::proto::ConsoleReply) {
        self.subscribers.retain(|sink| {
            let alive = sink.send(reply.clone()).is_ok();
            if !alive {
                debug!(job_id = %self.job_id, console = %sink.id(), "dropping dead subscriber");
            }
            alive
        });
    }

    // ---- telemetry --------------------------------------------------------

    /// Route one counter sample to its estimator, creating the service and
    /// host records on first sight.
    pub fn ingest(&mut self, registry: &ServiceRegistry, service_id: &str, ts: f64, value: f64) {
        if !self.services.contains_key(service_id) {
            let Some(hostname) = registry.host_of(service_id) else {
                debug!(service_id, job_id = %self.job_id, "sample for unknown service dropped");
                return;
            };
            info!(service_id, hostname, job_id = %self.job_id, "service now feeding job");
            self.hosts
                .entry(hostname.to_string())
                .or_insert_with(|| HostFlow::new(hostname))
                .service_ids
                .push(service_id.to_string());
            self.services
                .insert(service_id.to_string(), ServiceFlow::new());
        }
        if let Some(flow) = self.services.get_mut(service_id) {
            flow.observe(ts, value);
        }
    }

    /// Re-derive the per-host and aggregate rates from the estimators.
    /// Services without a known rate contribute zero.
    pub fn recompute_rate(&mut self) -> f64 {
        let mut total = 0.0;
        for host in self.hosts.values_mut() {
            host.rate = 0.0;
            for service_id in &host.service_ids {
                if let Some(rate) = self.services.get(service_id).and_then(ServiceFlow::rate) {
                    host.rate += rate;
                    total += rate;
                }
            }
        }
        self.rate = total;
        total
    }

    // ---- selectors --------------------------------------------------------

    /// Host with the highest programmed limit; ties broken by first-found.
    pub fn highest_limit_host(&self) -> Option<&HostFlow> {
        let mut selected: Option<&HostFlow> = None;
        for host in self.hosts.values() {
            if selected.map_or(true, |s| s.rate_limit < host.rate_limit) {
                selected = Some(host);
            }
        }
        selected
    }

    /// Host with the highest observed throughput; ties broken by first-found.
    pub fn highest_throughput_host(&self) -> Option<&HostFlow> {
        let mut selected: Option<&HostFlow> = None;
        for host in self.hosts.values() {
            if selected.map_or(true, |s| s.rate < host.rate) {
                selected = Some(host);
            }
        }
        selected
    }

    /// All hostnames in randomized order, to spread increase attempts.
    pub fn shuffled_hostnames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hosts.keys().cloned().collect();
        names.shuffle(&mut rand::thread_rng());
        names
    }

    // ---- actuation --------------------------------------------------------

    /// Program this job's rule on one host. The stored limit is only
    /// updated once the fleet accepted the command.
    pub async fn change_host_rate(
        &mut self,
        fleet: &dyn FleetActuator,
        hostname: &str,
        new_limit: u64,
    ) -> Result<()> {
        fleet
            .change_rate(hostname, &self.rule_name, new_limit)
            .await
            .with_context(|| {
                format!(
                    "change rate of job [{}] on host [{hostname}] to [{new_limit}]",
                    self.job_id
                )
            })?;
        if let Some(host) = self.hosts.get_mut(hostname) {
            host.rate_limit = new_limit;
        }
        Ok(())
    }

    /// Take `diff` MB/s away from the host with the highest limit. If that
    /// host's limit sits far above what it actually moves, collapse to the
    /// observed rate first so the decrease bites immediately.
    pub async fn decrease_highest_host(&mut self, fleet: &dyn FleetActuator, diff: f64) {
        let Some(selected) = self.highest_limit_host() else {
            warn!(job_id = %self.job_id, "no host to decrease rate on");
            return;
        };
        let hostname = selected.hostname.clone();
        let old = selected.rate_limit;
        let mut effective = old as f64;
        if effective > selected.rate * 1.1 {
            effective = selected.rate;
        }
        let after = (effective - diff)
            .max(MIN_RATE_LIMIT as f64)
            .min(DEFAULT_RATE_LIMIT as f64)
            .trunc() as u64;
        info!(
            job_id = %self.job_id, hostname, from = old, to = after,
            "decreasing host limit"
        );
        if let Err(error) = self.change_host_rate(fleet, &hostname, after).await {
            warn!(%error, "decrease was not applied");
        }
    }

    /// Give the host with the lowest limit the job's current deficit.
    pub async fn increase_lowest_host(&mut self, fleet: &dyn FleetActuator) {
        let Some(declared) = self.rate_limit else {
            return;
        };
        let mut selected: Option<&HostFlow> = None;
        for host in self.hosts.values() {
            if host.rate_limit >= DEFAULT_RATE_LIMIT {
                continue;
            }
            if selected.map_or(true, |s| s.rate_limit > host.rate_limit) {
                selected = Some(host);
            }
        }
        let Some(selected) = selected else {
            warn!(job_id = %self.job_id, "no host to increase rate on");
            return;
        };
        let hostname = selected.hostname.clone();
        let old = selected.rate_limit;
        let deficit = declared as f64 - self.rate;
        let after = ((old as f64 + deficit).trunc() as u64).min(DEFAULT_RATE_LIMIT);
        info!(
            job_id = %self.job_id, hostname, from = old, to = after,
            "increasing host limit"
        );
        if let Err(error) = self.change_host_rate(fleet, &hostname, after).await {
            warn!(%error, "increase was not applied");
        }
    }

    /// Push every host that is below the default back to the default.
    pub async fn reset_hosts_to_default(&mut self, fleet: &dyn FleetActuator) {
        let below: Vec<String> = self
            .hosts
            .values()
            .filter(|h| h.rate_limit < DEFAULT_RATE_LIMIT)
            .map(|h| h.hostname.clone())
            .collect();
        for hostname in below {
            if let Err(error) = self
                .change_host_rate(fleet, &hostname, DEFAULT_RATE_LIMIT)
                .await
            {
                warn!(%error, "reset to default was not applied");
            }
        }
    }

    /// Spread a fresh operator target evenly across this job's hosts and
    /// mark it as fanned out. No-op while the job has no hosts yet.
    // FIXME: split across hosts with actual throughput instead of all hosts
    // so idle hosts do not dilute the per-host share.
    pub async fn redistribute_limit(&mut self, fleet: &dyn FleetActuator, declared: u64) {
        if self.hosts.is_empty() {
            return;
        }
        let per_host = (declared / self.hosts.len() as u64).clamp(MIN_RATE_LIMIT, DEFAULT_RATE_LIMIT);
        let hostnames: Vec<String> = self.hosts.keys().cloned().collect();
        for hostname in hostnames {
            info!(
                job_id = %self.job_id, hostname = %hostname, limit = per_host,
                "applying operator rate limit"
            );
            if let Err(error) = self.change_host_rate(fleet, &hostname, per_host).await {
                warn!(%error, "operator limit was not applied");
            }
        }
        self.current_rate_limit = Some(declared);
    }

    #[cfg(test)]
    pub(crate) fn force_host(&mut self, hostname: &str, rate_limit: u64, rate: f64) {
        let host = self
            .hosts
            .entry(hostname.to_string())
            .or_insert_with(|| HostFlow::new(hostname));
        host.rate_limit = rate_limit;
        host.rate = rate;
    }
}
