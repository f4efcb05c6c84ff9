// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Subscription backend: spawns `pactl subscribe` as a child process and
//! parses its line-oriented event stream, rather than linking a native
//! client library — consistent with the CLI-protocol boundary the Server
//! Driver itself uses. New sink-input events bypass debouncing and drive
//! the Fast-Path Router directly; other relevant events feed the
//! reconcile scheduler's debounced trigger.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};

use audiorouter::{fast_path, ConfigStore, ServerDriver};

use crate::scheduler::Scheduler;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Bounds how long a single read can block so the shutdown flag is
/// rechecked periodically even when the server goes quiet.
const READ_POLL: Duration = Duration::from_millis(500);

enum ParsedEvent {
    NewSinkInput(u32),
    Relevant,
}

/// Categories the Event Loop cares about, per spec: sink-input, sink, and
/// server. Everything else (source, source-output, client, module, card)
/// is ignored here — microphone routing is handled by full reconciliation
/// rather than its own fast path.
fn classify(line: &str) -> Option<ParsedEvent> {
    let line = line.trim();
    let rest = line.strip_prefix("Event '")?;
    let (etype, rest) = rest.split_once('\'')?;
    let rest = rest.trim_start().strip_prefix("on ")?;

    let category_end = rest.find(" #").unwrap_or(rest.len());
    let category = rest[..category_end].trim();
    if !matches!(category, "sink-input" | "sink" | "server") {
        return None;
    }

    if category == "sink-input" && etype == "new" {
        let id: u32 = rest[category_end..]
            .trim_start_matches(" #")
            .split_whitespace()
            .next()?
            .parse()
            .ok()?;
        return Some(ParsedEvent::NewSinkInput(id));
    }
    Some(ParsedEvent::Relevant)
}

/// Run the subscription backend until `shutdown` is set, reconnecting
/// with a fixed delay whenever the child process or its stream fails.
pub async fn run(
    driver: Arc<dyn ServerDriver>,
    config_store: Arc<ConfigStore>,
    scheduler: Arc<Scheduler>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = run_once(&driver, &config_store, &scheduler, &shutdown).await {
            if !shutdown.load(Ordering::Relaxed) {
                warn!(
                    "subscription backend error: {}, reconnecting in {:?}",
                    e, RECONNECT_DELAY
                );
            }
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn run_once(
    driver: &Arc<dyn ServerDriver>,
    config_store: &Arc<ConfigStore>,
    scheduler: &Arc<Scheduler>,
    shutdown: &Arc<AtomicBool>,
) -> std::io::Result<()> {
    let mut cmd = tokio::process::Command::from(audiorouter::sandboxed_command(
        "pactl",
        &["subscribe"],
    ));
    cmd.stdout(Stdio::piped()).stderr(Stdio::null());
    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "pactl subscribe: no stdout")
        })?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    info!("subscribed to sound server events");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            let _ = child.kill().await;
            return Ok(());
        }

        let line = match tokio::time::timeout(READ_POLL, lines.next_line()).await {
            Ok(Ok(Some(l))) => l,
            Ok(Ok(None)) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "subscribe stream closed",
                ))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => continue,
        };

        match classify(&line) {
            Some(ParsedEvent::NewSinkInput(id)) => {
                debug!("new sink-input event: {}", id);
                let config = config_store.load();
                let driver_for_blocking = driver.clone();
                let routed = tokio::task::spawn_blocking(move || {
                    fast_path::route_sink_input_now(id, &config, driver_for_blocking.as_ref())
                })
                .await
                .unwrap_or(false);
                if routed {
                    debug!("fast-routed sink-input {} via subscription event", id);
                }
                // New events bypass debouncing: trigger reconciliation
                // immediately in addition to the fast-path move.
                scheduler.trigger_immediate();
            }
            Some(ParsedEvent::Relevant) => {
                scheduler.trigger_debounced();
            }
            None => {}
        }
    }
}
