//! File-poll CLI control surface (C8).
//!
//! A `tokio::time::interval`-driven task, the same sleep-then-read shape
//! `unicast_relay::run` uses for its own periodic polling (ticks then
//! fetches; this ticks then reads a command file). Thin: it only enqueues
//! through `Controller::request_switch`, never touches `ControllerState`
//! itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mswitch_core::Controller;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Poll `cmd_file` for a single command character, truncating the file
/// after each read. `0`..`9` enqueues a switch to that numeric index;
/// `s` logs the current status; any other byte (or an empty file) is
/// ignored.
pub async fn run(cmd_file: PathBuf, controller: Arc<Controller>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(target: mswitch_core::LOG_TARGET, path = %cmd_file.display(), "file-poll command surface started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(target: mswitch_core::LOG_TARGET, "file-poll command surface shutting down");
                return;
            }
            _ = interval.tick() => {
                handle_tick(&cmd_file, &controller).await;
            }
        }
    }
}

async fn handle_tick(cmd_file: &PathBuf, controller: &Controller) {
    let contents = match tokio::fs::read_to_string(cmd_file).await {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            debug!(target: mswitch_core::LOG_TARGET, error = %err, "failed to read command file");
            return;
        }
    };

    let Some(command) = contents.trim().chars().next() else {
        return;
    };

    if command == 's' {
        info!(
            target: mswitch_core::LOG_TARGET,
            active_index = controller.state.active_index(),
            switching = controller.state.switching(),
            "status requested via file-poll command"
        );
    } else if command.is_ascii_digit() {
        if let Err(err) = controller.request_switch(&command.to_string(), now_us()) {
            warn!(target: mswitch_core::LOG_TARGET, command = %command, error = %err, "file-poll switch command rejected");
        }
    } else {
        debug!(target: mswitch_core::LOG_TARGET, command = %command, "unrecognized file-poll command, ignoring");
    }

    if let Err(err) = tokio::fs::write(cmd_file, b"").await {
        warn!(target: mswitch_core::LOG_TARGET, error = %err, "failed to truncate command file after read");
    }
}
