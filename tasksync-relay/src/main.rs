//! `tasksync-relay`: WebSocket push relay for tasksync clients.
//!
//! ```bash
//! # Listen on 0.0.0.0:9100
//! cargo run --bin tasksync-relay
//!
//! # Smaller frames, loopback only
//! cargo run --bin tasksync-relay -- --bind 127.0.0.1:8080 --max-frame-size 16384
//!
//! # Inject a mutation from the server side
//! curl -X POST localhost:9100/events -d '{"type":"TASK_DELETED","payload":{"id":"1"}}'
//! ```
//!
//! On Ctrl-C every client gets a close frame, so it starts its reconnect
//! backoff instead of waiting on a dead socket.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tasksync_relay::config::{RelayCliArgs, RelayConfig};
use tasksync_relay::relay::{self, RelayError, RelayState};

/// How long shutdown waits for clients to acknowledge their close frames.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = RelayCliArgs::parse();
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("tasksync-relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match serve(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: &RelayConfig) -> Result<(), RelayError> {
    let state = Arc::new(RelayState::with_limits(config.limits));
    let (addr, server) =
        relay::start_server_with_state(&config.bind_addr.to_string(), Arc::clone(&state)).await?;
    tracing::info!(
        %addr,
        max_frame_size = config.limits.max_frame_size,
        broadcast_capacity = config.limits.broadcast_capacity.get(),
        "relay listening"
    );

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let clients = state.client_count().await;
            state.close_all_connections().await;
            let drained = tokio::time::timeout(CLOSE_GRACE, async {
                while state.client_count().await > 0 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await
            .is_ok();
            tracing::info!(clients, drained, relayed = state.relayed_count(), "relay shut down");
        }
    }
    Ok(())
}
