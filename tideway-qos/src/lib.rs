//! The rate-control core: telemetry in, TBF rate-limit commands out.
//!
//! Samples from the collector flow through [`session::SessionRegistry`]
//! into per-(service, job) estimators; once per second the tick loop
//! broadcasts fresh per-job rates to every subscribed console and lets the
//! active [`policy::RatePolicy`] adjust at most one per-host limit.
pub mod flow;
pub mod job;
pub mod policy;
pub mod proto;
pub mod registry;
pub mod session;
pub mod tick;

pub use registry::ServiceRegistry;
pub use session::{ConsoleSink, SessionRegistry};
