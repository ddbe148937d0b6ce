//! The policy that tunes every job in isolation.
//!
//! Suitable when the cluster has bandwidth for everyone, or when jobs do
//! fake I/O and the network is not the bottleneck. Each job is pulled
//! toward its declared target with a 10% deadband so the controller does
//! not oscillate around the setpoint.

use anyhow::Result;
use async_trait::async_trait;

use tideway_fleet::FleetActuator;

use crate::job::JobWatch;
use crate::session::JobTable;

use super::RatePolicy;

pub struct IndependentPolicy;

impl IndependentPolicy {
    pub fn new() -> Self {
        Self
    }

    async fn tune_job(job: &mut JobWatch, fleet: &dyn FleetActuator) {
        let rate = job.rate();
        let Some(declared) = job.rate_limit() else {
            // No operator target: make sure nothing is being held back.
            job.reset_hosts_to_default(fleet).await;
            return;
        };

        if job.current_rate_limit() != Some(declared) {
            // Bulk reconfiguration: the operator moved the target.
            job.redistribute_limit(fleet, declared).await;
            return;
        }

        if rate > declared as f64 * 1.1 {
            job.decrease_highest_host(fleet, rate - declared as f64).await;
        } else if rate < declared as f64 * 0.9 {
            job.increase_lowest_host(fleet).await;
        }
    }
}

impl Default for IndependentPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RatePolicy for IndependentPolicy {
    fn name(&self) -> &'static str {
        "independent"
    }

    async fn tune(&mut self, table: &mut JobTable) -> Result<()> {
        let fleet = table.fleet();
        for job_id in table.job_ids() {
            if let Some(job) = table.job_mut(&job_id) {
                Self::tune_job(job, fleet.as_ref()).await;
            }
        }
        Ok(())
    }
}
