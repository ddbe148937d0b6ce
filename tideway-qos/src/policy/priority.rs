//! The policy that satisfies the highest-priority jobs first.
//!
//! A one-action-at-a-time hill climb over the ordered job list. Each step
//! either continues evaluating the single in-flight action or starts a new
//! one; rule changes take a tick to show up in throughput, so the step
//! gate runs the search every other tick. When a job under its target
//! cannot be helped by raising its own limits, lower-priority jobs on the
//! same hosts are squeezed instead, and any move that hurts a
//! higher-priority job is rolled back.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use tideway_common::{DEFAULT_RATE_LIMIT, MIN_RATE_LIMIT};

use crate::session::JobTable;

use super::history::{ActionHistory, ActionKind, Expected, Step};
use super::RatePolicy;

pub struct PriorityPolicy {
    last_action: Option<ActionHistory>,
    max_failures: u32,
    /// Ticks between steps; evaluation needs one interval of fresh samples.
    interval: u32,
    count: u32,
}

impl PriorityPolicy {
    pub fn new() -> Self {
        Self {
            last_action: None,
            max_failures: 3,
            interval: 2,
            count: 0,
        }
    }

    /// Fan out freshly declared operator targets. Returns `true` when any
    /// job was reconfigured; operator intent replaces the running search.
    async fn apply_operator_limits(&self, table: &mut JobTable) -> bool {
        let fleet = table.fleet();
        let mut changed = false;
        for job_id in table.job_ids() {
            let Some(job) = table.job_mut(&job_id) else {
                continue;
            };
            if job.current_rate_limit() == job.rate_limit() {
                continue;
            }
            let Some(declared) = job.rate_limit() else {
                // Target withdrawn; stop forcing it and let the search run.
                job.set_current_rate_limit(None);
                continue;
            };
            if job.hosts().is_empty() {
                continue;
            }
            job.redistribute_limit(fleet.as_ref(), declared).await;
            changed = true;
        }
        changed
    }

    async fn start_action(
        &mut self,
        table: &mut JobTable,
        job_id: &str,
        failure_time: u32,
        prev: Option<&ActionHistory>,
    ) -> bool {
        debug!(job_id, "checking whether to start an action");
        let Some(job) = table.job(job_id) else {
            return false;
        };
        let rate = job.rate();
        let declared = job.rate_limit();

        if let Some(limit) = declared {
            if rate > limit as f64 * 1.1 {
                return self
                    .try_decrease_self(table, job_id, rate, limit, failure_time)
                    .await;
            }
        }

        let under_target = declared.map_or(true, |limit| rate < limit as f64 * 0.9);
        if !under_target {
            return false;
        }

        // The outcome of the previous action for this subject decides which
        // sub-action to lead with; the other one is the fallback.
        let prefer_increase = if declared.is_none() {
            true
        } else {
            match prev {
                None => true,
                Some(p) => match p.kind() {
                    ActionKind::IncreaseSelf | ActionKind::DecreaseSelf => {
                        p.action_good().unwrap_or(false)
                    }
                    ActionKind::DecreaseOthers => !p.action_good().unwrap_or(false),
                },
            }
        };

        if prefer_increase {
            if self.try_increase_self(table, job_id, failure_time).await {
                return true;
            }
            self.try_decrease_others(table, job_id, failure_time).await
        } else {
            if self.try_decrease_others(table, job_id, failure_time).await {
                return true;
            }
            self.try_increase_self(table, job_id, failure_time).await
        }
    }

    /// The job overshoots its target: claw the excess back from its
    /// busiest host.
    async fn try_decrease_self(
        &mut self,
        table: &mut JobTable,
        job_id: &str,
        rate: f64,
        limit: u64,
        failure_time: u32,
    ) -> bool {
        let selection = {
            let Some(job) = table.job(job_id) else {
                return false;
            };
            match job.highest_throughput_host() {
                Some(host) if host.rate() >= MIN_RATE_LIMIT as f64 => Some((
                    host.hostname().to_string(),
                    host.rate(),
                    host.rate_limit(),
                )),
                _ => None,
            }
        };
        let Some((hostname, host_rate, limit_before)) = selection else {
            debug!(job_id, "no decrease possible, every host is near idle");
            return false;
        };

        let diff = rate - limit as f64;
        let limit_after = (host_rate - diff)
            .max(MIN_RATE_LIMIT as f64)
            .min(DEFAULT_RATE_LIMIT as f64)
            .trunc() as u64;
        let mut action = ActionHistory::new(
            table,
            job_id,
            ActionKind::DecreaseSelf,
            job_id,
            &hostname,
            limit_before,
            limit_after,
            Expected::Decline,
            failure_time,
        );
        info!(job_id, "trying to decrease the job's own rate");
        match action.act(table).await {
            Ok(()) => {
                self.last_action = Some(action);
                true
            }
            Err(error) => {
                warn!(job_id, %error, "decrease-self did not start");
                false
            }
        }
    }

    /// Raise the subject's limit a notch on one of its hosts, chosen at
    /// random to spread attempts.
    async fn try_increase_self(
        &mut self,
        table: &mut JobTable,
        job_id: &str,
        failure_time: u32,
    ) -> bool {
        let selection = {
            let Some(job) = table.job(job_id) else {
                return false;
            };
            let mut found = None;
            for hostname in job.shuffled_hostnames() {
                let Some(host) = job.host(&hostname) else {
                    continue;
                };
                let before = host.rate_limit();
                let after = (before + 2 * MIN_RATE_LIMIT).min(DEFAULT_RATE_LIMIT);
                if after == before {
                    debug!(
                        job_id, hostname = %hostname,
                        "increase would change nothing on this host"
                    );
                    continue;
                }
                found = Some((hostname, before, after));
                break;
            }
            found
        };
        let Some((hostname, before, after)) = selection else {
            return false;
        };

        let mut action = ActionHistory::new(
            table,
            job_id,
            ActionKind::IncreaseSelf,
            job_id,
            &hostname,
            before,
            after,
            Expected::Rise,
            failure_time,
        );
        info!(job_id, "trying to raise the job's own limit");
        match action.act(table).await {
            Ok(()) => {
                self.last_action = Some(action);
                true
            }
            Err(error) => {
                warn!(job_id, %error, "increase-self did not start");
                false
            }
        }
    }

    /// Squeeze the busiest lower-priority job sharing a host with the
    /// subject down to the floor.
    async fn try_decrease_others(
        &mut self,
        table: &mut JobTable,
        job_id: &str,
        failure_time: u32,
    ) -> bool {
        let victim = {
            let Some(job) = table.job(job_id) else {
                return false;
            };
            let mut best: Option<(String, String, f64, u64)> = None;
            for hostname in job.hosts().keys() {
                let mut lower_priority = false;
                for (tmp_id, tmp_job) in table.jobs() {
                    if tmp_id == job_id {
                        lower_priority = true;
                        continue;
                    }
                    if !lower_priority {
                        continue;
                    }
                    if tmp_job.rate() == 0.0 {
                        continue;
                    }
                    let Some(tmp_host) = tmp_job.host(hostname) else {
                        continue;
                    };
                    if best.as_ref().map_or(true, |(_, _, rate, _)| *rate < tmp_host.rate()) {
                        best = Some((
                            tmp_id.clone(),
                            hostname.clone(),
                            tmp_host.rate(),
                            tmp_host.rate_limit(),
                        ));
                    }
                }
            }
            best
        };
        let Some((victim_id, hostname, _, before)) = victim else {
            info!(job_id, "no lower-priority job to squeeze");
            return false;
        };

        let after = MIN_RATE_LIMIT;
        if before == after {
            info!(job_id, victim = %victim_id, "victim is already at the floor");
            return false;
        }
        let mut action = ActionHistory::new(
            table,
            job_id,
            ActionKind::DecreaseOthers,
            &victim_id,
            &hostname,
            before,
            after,
            Expected::Rise,
            failure_time,
        );
        info!(job_id, victim = %victim_id, "trying to squeeze a lower-priority job");
        match action.act(table).await {
            Ok(()) => {
                self.last_action = Some(action);
                true
            }
            Err(error) => {
                warn!(job_id, %error, "decrease-others did not start");
                false
            }
        }
    }
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RatePolicy for PriorityPolicy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn reset(&mut self) {
        self.last_action = None;
        self.count = 0;
    }

    async fn tune(&mut self, table: &mut JobTable) -> Result<()> {
        self.count += 1;
        if self.count < self.interval {
            return Ok(());
        }
        self.count = 0;

        // Operator intent always wins over the in-flight search.
        if self.apply_operator_limits(table).await {
            self.last_action = None;
            return Ok(());
        }

        let mut resume_after = None;
        if let Some(mut action) = self.last_action.take() {
            match action.process(table).await {
                Step::InFlight => {
                    self.last_action = Some(action);
                    return Ok(());
                }
                Step::Done => {
                    let subject = action.subject().to_string();
                    if action.failure_time() > self.max_failures {
                        warn!(
                            job_id = %subject,
                            "too many action failures, not trying this job any more"
                        );
                    } else if self
                        .start_action(table, &subject, action.failure_time(), Some(&action))
                        .await
                    {
                        return Ok(());
                    }
                    resume_after = Some(subject);
                }
            }
        }

        // Round-robin: resume after the previous subject, or from the top
        // when there was none (or it is gone).
        let ids = table.job_ids();
        let start = resume_after
            .and_then(|subject| ids.iter().position(|id| *id == subject).map(|i| i + 1))
            .unwrap_or(0);
        for job_id in ids.into_iter().skip(start) {
            if self.start_action(table, &job_id, 0, None).await {
                return Ok(());
            }
        }
        Ok(())
    }
}
