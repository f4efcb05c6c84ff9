// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Polling safety net: scans the set of sink-input ids every 10 ms and
//! feeds any id not seen before to the Fast-Path Router. Needed because
//! some backends coalesce or delay subscribe events past the lifetime of
//! very short system sounds.
//!
//! Runs as a dedicated OS thread rather than a tokio task: the 10 ms
//! cadence is tight enough that a plain blocking sleep loop is simpler
//! and more predictable than cooperative scheduling would be.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use audiorouter::{fast_path, ConfigStore, ServerDriver};

pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn spawn(
    driver: Arc<dyn ServerDriver>,
    config_store: Arc<ConfigStore>,
    on_routed: impl Fn() + Send + 'static,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut seen: HashSet<u32> = driver
            .list_sink_inputs()
            .into_iter()
            .map(|s| s.id)
            .collect();

        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(POLL_INTERVAL);

            let current = driver.list_sink_inputs();
            for stream in &current {
                if seen.insert(stream.id) {
                    let config = config_store.load();
                    if fast_path::route_sink_input_now(stream.id, &config, driver.as_ref()) {
                        debug!("watchdog fast-routed sink-input {}", stream.id);
                        on_routed();
                    }
                }
            }
            let still_present: HashSet<u32> = current.iter().map(|s| s.id).collect();
            seen.retain(|id| still_present.contains(id));
        }
    })
}
