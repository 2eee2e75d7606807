//! `tasksync`: follows a push channel and prints the synced task list.
//!
//! The backend is in-memory (seeded from `--snapshot` or demo data); live
//! mutations arrive over the WebSocket push channel. Configuration via CLI
//! flags, environment variables, or config file
//! (`~/.config/tasksync/config.toml`).
//!
//! ```bash
//! # Follow a local relay with demo data
//! cargo run --bin tasksync -- --url ws://127.0.0.1:9100/ws
//!
//! # Seed from a JSON array of tasks, log to a file
//! cargo run --bin tasksync -- --snapshot tasks.json --log-file /tmp/tasksync.log
//! ```

use std::io;
use std::path::Path;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use tasksync::api::memory::{InMemoryTaskApi, demo_users};
use tasksync::config::{CliArgs, ClientConfig};
use tasksync::coordinator::{Origin, SyncCoordinator, SyncEvent};
use tasksync::tasks::{TaskCollection, TaskFilter};
use tasksync::transport::websocket::WebSocketTransport;
use tasksync_proto::push::decode_snapshot_json;
use tasksync_proto::task::{Task, Timestamp};

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    // CLI args > config file > env > defaults.
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(url = %config.push_url, "tasksync starting");

    let api = match config.seed_file.as_deref() {
        Some(path) => seeded_api(path)?,
        None => InMemoryTaskApi::with_demo_data(),
    };
    let user = api.current_user().clone();
    let transport =
        WebSocketTransport::new(config.push_url.clone()).with_connect_timeout(config.connect_timeout);
    let coordinator = SyncCoordinator::new(api, transport, user, config.to_sync_options());

    let mut events = coordinator.event_channel(config.channel_capacity);
    coordinator.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
        }
    }

    coordinator.stop().await;
    tracing::info!("tasksync exiting");
    Ok(())
}

/// Initialize logging.
///
/// Logs go to `file_path` if given, otherwise to stderr, so stdout stays
/// reserved for the task list. Returns a [`WorkerGuard`] that must be held
/// until shutdown to ensure all buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let file = file_path.and_then(|p| Some((p.parent()?, p.file_name()?)));
    let (writer, guard, ansi) = match file {
        Some((dir, name)) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (writer, guard, false)
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(io::stderr());
            (writer, guard, true)
        }
    };

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(env_filter)
        .with_ansi(ansi)
        .init();

    guard
}

/// Builds the backend from a JSON array of tasks.
fn seeded_api(path: &Path) -> io::Result<InMemoryTaskApi> {
    let text = std::fs::read_to_string(path)?;
    let tasks = decode_snapshot_json(&text).map_err(io::Error::other)?;
    tracing::info!(path = %path.display(), tasks = tasks.len(), "seeding backend");
    let [owner, ..] = demo_users();
    let api = InMemoryTaskApi::new(owner);
    api.seed(tasks);
    Ok(api)
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::CollectionChanged {
            tasks,
            changes,
            origin,
        } => {
            let origin = match origin {
                Origin::Snapshot => "snapshot".to_string(),
                Origin::Push { seq } => format!("push #{seq}"),
                Origin::Local => "local".to_string(),
                Origin::Confirmed => "confirmed".to_string(),
                Origin::Rollback => "rollback".to_string(),
            };
            println!(
                "== {origin}: +{} ~{} -{} ({} tasks)",
                changes.inserted.len(),
                changes.updated.len(),
                changes.removed.len(),
                tasks.len()
            );
            print_tasks(tasks);
        }
        SyncEvent::ConnectionChanged(state) => println!("-- push channel {state}"),
        SyncEvent::ReconnectScheduled {
            attempt,
            max_attempts,
            delay,
        } => println!(
            "-- reconnecting in {}ms (attempt {attempt}/{max_attempts})",
            delay.as_millis()
        ),
        SyncEvent::SnapshotFailed { attempt, error } => {
            println!("-- snapshot fetch failed (attempt {attempt}): {error}");
        }
    }
}

fn print_tasks(tasks: &TaskCollection) {
    let now = Timestamp::now();
    let groups = tasks.by_priority(&TaskFilter::default());
    for (label, group) in [("high", &groups.high), ("medium", &groups.medium), ("low", &groups.low)] {
        if group.is_empty() {
            continue;
        }
        println!("  {label}:");
        for task in group {
            println!("    {}", task_line(task, now));
        }
    }
}

fn task_line(task: &Task, now: Timestamp) -> String {
    use std::fmt::Write as _;

    let mut line = format!("[{}] {}", task.status, task.title);
    if let Some(assignee) = &task.assigned_to {
        let _ = write!(line, " @{}", assignee.name);
    }
    if let Some(due) = task.due_date {
        let overdue = if task.is_overdue(now) { " OVERDUE" } else { "" };
        let _ = write!(line, " (due {}{overdue})", format_date(due));
    }
    let _ = write!(line, " (updated {})", format_time(task.updated_at));
    line
}

/// Format a timestamp as a local calendar date.
fn format_date(at: Timestamp) -> String {
    format_local(at, "%Y-%m-%d")
}

/// Format a timestamp as local "HH:MM:SS".
fn format_time(at: Timestamp) -> String {
    format_local(at, "%H:%M:%S")
}

fn format_local(at: Timestamp, fmt: &str) -> String {
    use chrono::{Local, TimeZone};
    let millis = i64::try_from(at.as_millis()).unwrap_or(i64::MAX);
    match Local.timestamp_millis_opt(millis) {
        chrono::LocalResult::Single(dt) => dt.format(fmt).to_string(),
        _ => "??".to_string(),
    }
}
