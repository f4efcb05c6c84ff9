// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! audiorouter-daemon — the Event Loop / Scheduler.
//!
//! Acquires the single-instance lock, waits for the sound server, runs an
//! initial reconciliation, then drives three concurrent tasks for the
//! rest of the process's life: the subscription backend, the polling
//! safety net, and the reconcile coordinator. Exits 0 on a clean stop,
//! non-zero if the lock is contended or the server never comes up.

mod error;
mod lock;
mod scheduler;
mod subscribe;
mod watchdog;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use audiorouter::{ConfigStore, PactlDriver, ServerDriver, StateStore};

use error::AudioRouterError;
use scheduler::Scheduler;

/// How long startup waits for the sound server to become reachable
/// before giving up.
const SERVER_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
const SERVER_WAIT_POLL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), AudioRouterError> {
    info!("audiorouter-daemon starting");

    let _lock = lock::acquire()?;
    info!(pid = std::process::id(), "single-instance lock acquired");

    let driver: Arc<dyn ServerDriver> = Arc::new(PactlDriver::new());
    let config_store = Arc::new(ConfigStore::new()?);
    let state_store = Arc::new(StateStore::new()?);

    wait_for_server(driver.clone()).await?;
    info!("sound server is reachable");

    run_initial_reconcile(driver.clone(), config_store.clone(), state_store.clone()).await;

    let shutdown = Arc::new(AtomicBool::new(false));
    let scheduler = Scheduler::new(driver.clone(), config_store.clone(), state_store.clone());

    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown.clone()));
    let subscribe_task = tokio::spawn(subscribe::run(
        driver.clone(),
        config_store.clone(),
        scheduler.clone(),
        shutdown.clone(),
    ));

    let watchdog_scheduler = scheduler.clone();
    let watchdog_shutdown = shutdown.clone();
    let watchdog_handle = watchdog::spawn(
        driver.clone(),
        config_store.clone(),
        move || watchdog_scheduler.trigger_immediate(),
        watchdog_shutdown,
    );

    wait_for_shutdown_signal().await;
    info!("shutdown requested, stopping event loop");
    shutdown.store(true, Ordering::Relaxed);

    let _ = tokio::time::timeout(Duration::from_secs(2), scheduler_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), subscribe_task).await;
    let _ = tokio::task::spawn_blocking(move || watchdog_handle.join()).await;

    info!("audiorouter-daemon stopped");
    Ok(())
}

async fn run_initial_reconcile(
    driver: Arc<dyn ServerDriver>,
    config_store: Arc<ConfigStore>,
    state_store: Arc<StateStore>,
) {
    let report = tokio::task::spawn_blocking(move || {
        let config = config_store.load();
        let mut state = state_store.load();
        let report = audiorouter::reconcile(&config, &mut state, driver.as_ref());
        if let Err(e) = state_store.save(&state) {
            warn!(
                "failed to persist runtime state after initial reconcile: {}",
                e
            );
        }
        report
    })
    .await
    .unwrap_or_default();
    info!(?report, "initial reconciliation complete");
}

async fn wait_for_server(driver: Arc<dyn ServerDriver>) -> Result<(), AudioRouterError> {
    let start = Instant::now();
    loop {
        let d = driver.clone();
        let reachable = tokio::task::spawn_blocking(move || d.try_info())
            .await
            .unwrap_or(false);
        if reachable {
            return Ok(());
        }
        if start.elapsed() >= SERVER_WAIT_TIMEOUT {
            return Err(AudioRouterError::ServerUnreachable);
        }
        tokio::time::sleep(SERVER_WAIT_POLL).await;
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
