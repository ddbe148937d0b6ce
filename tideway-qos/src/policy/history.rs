//! The record of one attempted tune action and its two-tick evaluation.
//!
//! Every action is a single bounded, invertible knob turn: one rule, one
//! host, old limit to new limit. The record captures rate snapshots around
//! the change and decides whether the action helped, did nothing, or hurt
//! a higher-priority job badly enough to be rolled back.

use anyhow::Result;
use indexmap::IndexMap;
use tracing::{error, info, warn};

use tideway_common::MIN_RATE_LIMIT;

use crate::session::JobTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    IncreaseSelf,
    DecreaseSelf,
    DecreaseOthers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    Rise,
    Decline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Origin,
    Acted,
    Regretted,
}

/// What `process` left behind: a regret still needs its follow-up
/// snapshot, or the evaluation is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    InFlight,
    Done,
}

pub struct ActionHistory {
    /// Job whose rate prompted the action.
    subject: String,
    /// Job whose limit was changed; differs from `subject` for
    /// decrease-others.
    actor: String,
    hostname: String,
    limit_before: u64,
    limit_after: u64,
    kind: ActionKind,
    expected: Expected,
    stage: Stage,
    rates_original: IndexMap<String, f64>,
    rates_after_action: Option<IndexMap<String, f64>>,
    rates_after_regret: Option<IndexMap<String, f64>>,
    failure_time: u32,
    action_good: Option<bool>,
}

impl ActionHistory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: &JobTable,
        subject: &str,
        kind: ActionKind,
        actor: &str,
        hostname: &str,
        limit_before: u64,
        limit_after: u64,
        expected: Expected,
        failure_time: u32,
    ) -> Self {
        Self {
            subject: subject.to_string(),
            actor: actor.to_string(),
            hostname: hostname.to_string(),
            limit_before,
            limit_after,
            kind,
            expected,
            stage: Stage::Origin,
            rates_original: table.save_rates(subject, actor),
            rates_after_action: None,
            rates_after_regret: None,
            failure_time,
            action_good: None,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn failure_time(&self) -> u32 {
        self.failure_time
    }

    pub fn action_good(&self) -> Option<bool> {
        self.action_good
    }

    /// Issue the actuator command. A failure leaves the record in its
    /// origin stage so the caller can discard it without unwinding.
    pub async fn act(&mut self, table: &mut JobTable) -> Result<()> {
        debug_assert_eq!(self.stage, Stage::Origin);
        info!(
            host = %self.hostname, job_id = %self.actor,
            from = self.limit_before, to = self.limit_after,
            "changing rate for action"
        );
        table
            .change_job_host_rate(&self.actor, &self.hostname, self.limit_after)
            .await?;
        self.stage = Stage::Acted;
        Ok(())
    }

    /// Advance the evaluation one step. Call once per policy step while
    /// the action is in flight.
    pub async fn process(&mut self, table: &mut JobTable) -> Step {
        match self.stage {
            Stage::Acted => {
                let after = table.save_rates(&self.subject, &self.actor);
                let benefit = self.expected_result_met(&after);
                let prior = self.prior_declined(&after, MIN_RATE_LIMIT as f64 / 2.0);
                let actor_hurt = self.actor_declined(&after);
                self.rates_after_action = Some(after);

                if prior || (!benefit && actor_hurt) {
                    self.failure_time += 1;
                    self.action_good = Some(false);
                    match self.regret(table).await {
                        Ok(()) => Step::InFlight,
                        Err(error) => {
                            warn!(%error, "could not roll the action back");
                            Step::Done
                        }
                    }
                } else if !benefit {
                    self.failure_time += 1;
                    self.action_good = Some(false);
                    Step::Done
                } else {
                    self.action_good = Some(true);
                    Step::Done
                }
            }
            Stage::Regretted => {
                let after = table.save_rates(&self.subject, &self.actor);
                let still_declined = self.prior_declined(&after, MIN_RATE_LIMIT as f64);
                self.rates_after_regret = Some(after);
                if still_declined {
                    warn!(
                        subject = %self.subject, actor = %self.actor,
                        "action caused a decline and regretting did not recover it"
                    );
                } else {
                    info!(
                        subject = %self.subject, actor = %self.actor,
                        "action caused a decline and regretting recovered it"
                    );
                }
                Step::Done
            }
            Stage::Origin => {
                debug_assert!(false, "process called before act");
                Step::Done
            }
        }
    }

    /// Restore the pre-action limit on the same (actor, host) pair.
    async fn regret(&mut self, table: &mut JobTable) -> Result<()> {
        warn!(
            host = %self.hostname, job_id = %self.actor,
            from = self.limit_after, back_to = self.limit_before,
            "regretting action"
        );
        table
            .change_job_host_rate(&self.actor, &self.hostname, self.limit_before)
            .await?;
        self.stage = Stage::Regretted;
        Ok(())
    }

    /// Did any job at strictly higher priority than the subject drop by
    /// more than `threshold` since the original snapshot?
    fn prior_declined(&self, after: &IndexMap<String, f64>, threshold: f64) -> bool {
        for (job_id, after_rate) in after {
            if *job_id == self.subject {
                break;
            }
            let Some(original) = self.rates_original.get(job_id) else {
                continue;
            };
            if after_rate + threshold < *original {
                return true;
            }
        }
        false
    }

    fn actor_declined(&self, after: &IndexMap<String, f64>) -> bool {
        let (Some(original), Some(current)) = (
            self.rates_original.get(&self.actor),
            after.get(&self.actor),
        ) else {
            error!(actor = %self.actor, "no rate snapshot for acting job");
            return false;
        };
        current + MIN_RATE_LIMIT as f64 / 2.0 < *original
    }

    /// Did the subject move in the expected direction by a full
    /// `MIN_RATE_LIMIT`?
    fn expected_result_met(&self, after: &IndexMap<String, f64>) -> bool {
        let (Some(original), Some(current)) = (
            self.rates_original.get(&self.subject),
            after.get(&self.subject),
        ) else {
            error!(subject = %self.subject, "no rate snapshot for subject job");
            return false;
        };
        match self.expected {
            Expected::Rise => *current >= original + MIN_RATE_LIMIT as f64,
            Expected::Decline => current + MIN_RATE_LIMIT as f64 <= *original,
        }
    }
}
