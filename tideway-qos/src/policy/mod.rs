//! Rate policies: the per-tick tune step.
//!
//! A policy may read the whole job table and issue a bounded number of
//! actuator commands per step. The session registry owns one instance of
//! each policy and dispatches to whichever the operator selected.

use anyhow::Result;
use async_trait::async_trait;

use crate::session::JobTable;

pub mod history;
pub mod independent;
pub mod priority;

#[async_trait]
pub trait RatePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one tune step over the table.
    async fn tune(&mut self, table: &mut JobTable) -> Result<()>;

    /// Forget in-flight state; called when the operator switches away.
    fn reset(&mut self) {}
}
