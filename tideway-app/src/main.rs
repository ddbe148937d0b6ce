use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tideway_common::observability::{init_logging, LogConfig};
use tideway_config::ClusterConfigLoader;
use tideway_fleet::{FleetActuator, SshFleet};
use tideway_qos::{tick, SessionRegistry};
use tideway_web::AppState;

use runtime::ControllerRuntime;

mod bootstrap;
mod runtime;

/// Per-job I/O QoS controller for Lustre clusters.
#[derive(Parser, Debug)]
#[command(name = "tideway", version)]
struct Cli {
    /// Cluster bootstrap file (the same object consoles send).
    #[arg(long, default_value = "static/lime_config.json")]
    config: PathBuf,

    /// Address the metric ingest and console endpoints listen on.
    #[arg(long, env = "TIDEWAY_LISTEN", default_value = "0.0.0.0:24")]
    listen: SocketAddr,

    /// Log directory override.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_path = init_logging(LogConfig {
        log_dir: cli.log_dir.clone(),
        emit_stderr: true,
        ..Default::default()
    })?;
    info!(log = %log_path.display(), "tideway starting");

    let runtime = ControllerRuntime::new()?;
    runtime.trip_on_ctrl_c();
    let outcome = runtime.run(serve(&cli, runtime.cancel_token()));
    runtime.shutdown();
    if let Err(error) = &outcome {
        error!(%error, "tideway exiting on error");
    }
    outcome
}

async fn serve(cli: &Cli, cancel: CancellationToken) -> Result<()> {
    let cluster = ClusterConfigLoader::new()
        .with_file(&cli.config)
        .load()
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let hostnames: Vec<String> = cluster.hosts.iter().map(|h| h.name.clone()).collect();
    let identity = cluster.ssh_identity_file.as_ref().map(PathBuf::from);
    let fleet: Arc<dyn FleetActuator> =
        Arc::new(SshFleet::new(&cluster.name, hostnames, identity));

    // Everything in here is fatal: a cluster we could not prepare is a
    // cluster we must not steer.
    let registry = bootstrap::bootstrap(fleet.as_ref(), &cluster).await?;

    let session = Arc::new(Mutex::new(SessionRegistry::new(
        Arc::new(registry),
        fleet,
        &cluster.policy,
        cluster.fake_io,
    )));

    let ticker = tokio::spawn(tick::run_ticker(session.clone(), cancel.child_token()));

    let router = tideway_web::router(AppState { session });
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!(listen = %cli.listen, "serving metric ingest and console");

    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("http server failed")?;

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), ticker).await;
    Ok(())
}
