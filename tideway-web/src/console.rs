//! The operator console: a duplex websocket.
//!
//! The first inbound message names the jobs this console wants to watch;
//! every later message is a configuration update and gets exactly one
//! `command_result` reply. Outbound datapoints flow through an unbounded
//! channel so the tick loop never blocks on a slow console; a dead socket
//! surfaces as a failed channel send and the session reaps the watches.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use tideway_config::ClusterFile;
use tideway_qos::proto::{CommandOutcome, ConsoleReply};
use tideway_qos::ConsoleSink;

use crate::AppState;

pub async fn console_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_console(socket, state))
}

async fn handle_console(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // First message: the cluster object whose job list we subscribe to.
    let first = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(error)) => {
                debug!(%error, "console closed before configuring");
                return;
            }
        }
    };
    let file: ClusterFile = match serde_json::from_str(&first) {
        Ok(file) => file,
        Err(error) => {
            warn!(%error, "malformed console hello");
            return;
        }
    };

    let (sink, mut rx) = ConsoleSink::channel();
    let console_id = sink.id();
    let watched: Vec<String> = file.cluster.jobs.iter().map(|j| j.job_id.clone()).collect();
    {
        let mut session = state.session.lock().await;
        for job_id in &watched {
            session.watch(job_id, sink.clone()).await;
        }
    }
    info!(console = %console_id, jobs = watched.len(), "console connected");

    // Pump broadcast frames out to the socket.
    let forward = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&reply) else {
                continue;
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let outcome = match serde_json::from_str::<ClusterFile>(&text) {
                    Ok(update) => {
                        let mut session = state.session.lock().await;
                        match session.update_config(&update.cluster).await {
                            Ok(()) => CommandOutcome::Success,
                            Err(error) => {
                                warn!(%error, "config update failed");
                                CommandOutcome::Failure
                            }
                        }
                    }
                    Err(error) => {
                        warn!(%error, "malformed console message");
                        CommandOutcome::Failure
                    }
                };
                if sink.send(ConsoleReply::config_result(outcome)).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(%error, "console receive error");
                break;
            }
        }
    }

    // The console is gone: release every job it watched.
    {
        let mut session = state.session.lock().await;
        for job_id in &watched {
            session.unwatch(job_id, console_id).await;
        }
    }
    drop(sink);
    let _ = forward.await;
    info!(console = %console_id, "console closed");
}
