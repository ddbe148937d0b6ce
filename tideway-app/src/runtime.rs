//! Process runtime and shutdown plumbing.
//!
//! The controller runs three long-lived pieces: the tick loop, the HTTP
//! surface, and a ctrl-c watcher. They all hang off one cancellation
//! token, so stopping the process is: trip the token, let the server
//! finish in-flight requests, then drain the runtime with a bounded
//! grace period.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How long task teardown may take once the token is tripped. The tick
/// loop can be mid-command against an unreachable host; the fleet
/// driver's own timeouts keep this bound honest.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct ControllerRuntime {
    runtime: Runtime,
    cancel: CancellationToken,
}

impl ControllerRuntime {
    /// Build the process runtime. The workload is two tasks and a
    /// trickle of metric POSTs, so the default thread pool is left alone
    /// and only named for diagnostics.
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("tideway")
            .build()?;
        Ok(Self {
            runtime,
            cancel: CancellationToken::new(),
        })
    }

    /// The token every long-lived task selects on. Hand the tick loop a
    /// `child_token()` so tests can stop it without tripping the process.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Trip the shared token on ctrl-c.
    pub fn trip_on_ctrl_c(&self) {
        let cancel = self.cancel.clone();
        self.runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, shutting down");
                cancel.cancel();
            }
        });
    }

    /// Drive the controller future to completion.
    pub fn run<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    /// Cancel whatever is still running and drain the pool.
    pub fn shutdown(self) {
        self.cancel.cancel();
        self.runtime.shutdown_timeout(SHUTDOWN_GRACE);
    }
}
