// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reconcile coordinator: single-flight scheduling of full reconciliation
//! runs, triggered either immediately (new-stream events, the watchdog) or
//! debounced (topology-change events) or on a low-rate maintenance tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use audiorouter::{ConfigStore, ServerDriver, StateStore};

/// An "other" event triggers full reconciliation at most once per this
/// window.
pub const EVENT_DEBOUNCE: Duration = Duration::from_millis(250);
/// Low-rate baseline reconciliation, independent of event traffic.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);
/// How often the run loop wakes to recheck the shutdown flag when nothing
/// else is pending.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Coalesces reconcile triggers into single-flight runs. `Notify` already
/// buffers at most one permit when `notify_one` is called while nothing is
/// waiting, which is exactly the "at most one pending request" coalescing
/// the event loop requires.
pub struct Scheduler {
    driver: Arc<dyn ServerDriver>,
    config_store: Arc<ConfigStore>,
    state_store: Arc<StateStore>,
    immediate: Notify,
    debounced: Notify,
}

impl Scheduler {
    pub fn new(
        driver: Arc<dyn ServerDriver>,
        config_store: Arc<ConfigStore>,
        state_store: Arc<StateStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver,
            config_store,
            state_store,
            immediate: Notify::new(),
            debounced: Notify::new(),
        })
    }

    /// Bypasses the debounce window: used for new-stream events and the
    /// polling safety net, where the fast-path move already happened and
    /// reconciliation should catch up immediately.
    pub fn trigger_immediate(&self) {
        self.immediate.notify_one();
    }

    /// Rate-limited to [`EVENT_DEBOUNCE`]: used for topology-change events
    /// (sink/server) that don't need sub-stream urgency.
    pub fn trigger_debounced(&self) {
        self.debounced.notify_one();
    }

    async fn run_once(&self) {
        let driver = self.driver.clone();
        let config_store = self.config_store.clone();
        let state_store = self.state_store.clone();

        let result = tokio::task::spawn_blocking(move || {
            let config = config_store.load();
            let mut state = state_store.load();
            let report = audiorouter::reconcile(&config, &mut state, driver.as_ref());
            if let Err(e) = state_store.save(&state) {
                warn!("failed to persist runtime state: {}", e);
            }
            report
        })
        .await;

        if let Err(e) = result {
            warn!("reconcile task panicked: {}", e);
        }
    }

    /// Drive the coordinator until `shutdown` is set. Runs at most one
    /// reconciliation at a time: the loop body only ever awaits one
    /// `run_once` before returning to `select!`, so triggers that arrive
    /// mid-run simply wait for the next iteration.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        let mut last_run = Instant::now() - EVENT_DEBOUNCE;
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !shutdown.load(Ordering::Relaxed) {
            tokio::select! {
                _ = self.immediate.notified() => {
                    debug!("immediate reconcile trigger");
                    self.run_once().await;
                    last_run = Instant::now();
                }
                _ = self.debounced.notified() => {
                    if last_run.elapsed() >= EVENT_DEBOUNCE {
                        debug!("debounced reconcile trigger");
                        self.run_once().await;
                        last_run = Instant::now();
                    }
                }
                _ = maintenance.tick() => {
                    debug!("maintenance tick reconcile");
                    self.run_once().await;
                    last_run = Instant::now();
                }
                _ = tokio::time::sleep(SHUTDOWN_POLL) => {}
            }
        }
        info!("reconcile coordinator stopped");
    }
}
