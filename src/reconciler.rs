// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The idempotent reconciliation algorithm: reads desired configuration
//! and the ownership ledger, queries the Server Driver, issues commands,
//! and writes the ledger back.

use std::collections::HashSet;
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::classifier::is_system_stream;
use crate::model::{Config, RouteTarget, RuntimeState, SYSTEM_BUS_NAME};
use crate::server_driver::ServerDriver;
use crate::trace::trace;

/// Loopback latency requested for every loopback this process creates.
pub const LOOPBACK_LATENCY_MS: u32 = 30;

/// Pre-load settle sleep before installing a break-before-make loopback.
pub const PRE_LOAD_SETTLE: Duration = Duration::from_millis(20);
/// Mute window held while a loopback touching a virtual bus is swapped.
pub const VIRTUAL_SWITCH_MUTE: Duration = Duration::from_millis(120);
/// Mute window held while a purely physical loopback is swapped.
pub const PHYSICAL_SWITCH_MUTE: Duration = Duration::from_millis(50);

/// Counters surfaced purely for structured logging; never consulted by
/// the algorithm itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub sinks_created: u32,
    pub sinks_destroyed: u32,
    pub routes_created: u32,
    pub routes_destroyed: u32,
    pub streams_moved: u32,
}

/// Run one full reconciliation pass. Idempotent: given a steady
/// configuration and server state, a second call issues no commands.
pub fn reconcile(
    config: &Config,
    state: &mut RuntimeState,
    driver: &dyn ServerDriver,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    remove_ghosts(config, state, driver, &mut report);
    ensure_null_sinks(config, state, driver, &mut report);
    apply_routes(config, state, driver, &mut report);
    apply_input_routes(config, state, driver);

    if let Err(e) = driver.ensure_module_loaded("module-intended-roles", "") {
        debug!("ensure_module_loaded(module-intended-roles) failed: {}", e);
    }

    apply_stream_rules(config, driver, &mut report);
    apply_mic_rules(config, driver, &mut report);

    info!(
        sinks_created = report.sinks_created,
        sinks_destroyed = report.sinks_destroyed,
        routes_created = report.routes_created,
        routes_destroyed = report.routes_destroyed,
        streams_moved = report.streams_moved,
        "reconciliation complete"
    );
    report
}

fn remove_ghosts(
    config: &Config,
    state: &mut RuntimeState,
    driver: &dyn ServerDriver,
    report: &mut ReconcileReport,
) {
    let configured_buses: HashSet<&str> = config.buses.iter().map(|b| b.name.as_str()).collect();
    let configured_sources: HashSet<&str> = config
        .input_routes
        .iter()
        .map(|r| r.source.as_str())
        .collect();

    for bus in state
        .route_modules
        .keys()
        .cloned()
        .collect::<Vec<_>>()
    {
        if !configured_buses.contains(bus.as_str()) {
            if let Some(id) = state.route_modules.remove(&bus) {
                let _ = driver.unload_module(id);
                report.routes_destroyed += 1;
            }
            state.route_target.remove(&bus);
        }
    }

    for source in state
        .input_route_modules
        .keys()
        .cloned()
        .collect::<Vec<_>>()
    {
        if !configured_sources.contains(source.as_str()) {
            if let Some(id) = state.input_route_modules.remove(&source) {
                let _ = driver.unload_module(id);
            }
            state.input_route_target.remove(&source);
        }
    }

    for bus in state.bus_modules.keys().cloned().collect::<Vec<_>>() {
        if !configured_buses.contains(bus.as_str()) {
            if let Some(id) = state.bus_modules.remove(&bus) {
                let _ = driver.unload_module(id);
                report.sinks_destroyed += 1;
            }
        }
    }
}

fn ensure_null_sinks(
    config: &Config,
    state: &mut RuntimeState,
    driver: &dyn ServerDriver,
    report: &mut ReconcileReport,
) {
    for bus in &config.buses {
        if !driver.sink_exists(&bus.name) {
            match driver.load_null_sink(&bus.name, &bus.label) {
                Ok(id) => {
                    state.bus_modules.insert(bus.name.clone(), id);
                    report.sinks_created += 1;
                }
                Err(e) => {
                    warn!("failed to create null sink {}: {}", bus.name, e);
                    continue;
                }
            }
        }

        if bus.name == SYSTEM_BUS_NAME {
            if let Err(e) = driver.set_sink_properties(
                &bus.name,
                &[("device.intended_roles", "event notification")],
            ) {
                warn!("failed to tag system bus {}: {}", bus.name, e);
            }
        }
    }
}

/// Resolve a bus's `route_to` to a concrete sink name, or `None` if there
/// is nothing to route to yet.
fn resolve_target(route_to: &RouteTarget, driver: &dyn ServerDriver) -> Option<String> {
    match route_to {
        RouteTarget::None => None,
        RouteTarget::Sink(name) => Some(name.clone()),
        RouteTarget::Default => {
            let default = driver.get_default_sink();
            if default.as_deref().map(|d| d.starts_with("vsink.")).unwrap_or(true) {
                driver
                    .list_sinks()
                    .into_iter()
                    .find(|s| !s.name.starts_with("vsink."))
                    .map(|s| s.name)
                    .or(default)
            } else {
                default
            }
        }
    }
}

fn apply_routes(
    config: &Config,
    state: &mut RuntimeState,
    driver: &dyn ServerDriver,
    report: &mut ReconcileReport,
) {
    for bus in &config.buses {
        if matches!(bus.route_to, RouteTarget::None) {
            if let Some(id) = state.route_modules.remove(&bus.name) {
                let _ = driver.unload_module(id);
                report.routes_destroyed += 1;
            }
            state.route_target.insert(bus.name.clone(), "none".to_string());
            continue;
        }

        let Some(target) = resolve_target(&bus.route_to, driver) else {
            continue;
        };
        if target == bus.name || target.ends_with(".monitor") {
            continue;
        }

        let monitor = bus.monitor_name();
        if !driver.source_exists(&monitor) {
            // Null sink was just created; its monitor hasn't appeared yet.
            continue;
        }

        if driver.loopback_exists(&monitor, &target) {
            state.route_target.insert(bus.name.clone(), target.clone());
            driver.cleanup_wrong_loopbacks_for_source(&monitor, &target);
            continue;
        }

        perform_handover(&bus.name, &monitor, &target, state, driver, report);
    }
}

fn perform_handover(
    bus_name: &str,
    monitor: &str,
    target: &str,
    state: &mut RuntimeState,
    driver: &dyn ServerDriver,
    report: &mut ReconcileReport,
) {
    let prev_target = state.route_target.get(bus_name).cloned();
    let involves_virtual = target.starts_with("vsink.")
        || prev_target
            .as_deref()
            .map(|p| p.starts_with("vsink."))
            .unwrap_or(false);
    let prev_module = state.route_modules.get(bus_name).copied();
    let prev_owned_inputs = prev_module
        .map(|id| driver.sink_inputs_for_owner_module(id))
        .unwrap_or_default();

    trace(&format!(
        "handover start bus={} monitor={} target={} involves_virtual={}",
        bus_name, monitor, target, involves_virtual
    ));

    let _ = driver.set_sink_mute(bus_name, true);
    let _ = driver.set_source_mute(monitor, true);
    for id in &prev_owned_inputs {
        let _ = driver.set_sink_input_mute(*id, true);
    }

    let new_module = if involves_virtual {
        driver.cleanup_wrong_loopbacks_for_source(monitor, target);
        sleep(PRE_LOAD_SETTLE);
        let result = driver.load_loopback(monitor, target, LOOPBACK_LATENCY_MS);
        sleep(VIRTUAL_SWITCH_MUTE);
        result
    } else {
        let result = driver.load_loopback(monitor, target, LOOPBACK_LATENCY_MS);
        driver.cleanup_wrong_loopbacks_for_source(monitor, target);
        sleep(PHYSICAL_SWITCH_MUTE);
        result
    };

    let new_owned_inputs = match &new_module {
        Ok(id) => driver.sink_inputs_for_owner_module(*id),
        Err(_) => Vec::new(),
    };

    for id in &prev_owned_inputs {
        let _ = driver.set_sink_input_mute(*id, false);
    }
    for id in &new_owned_inputs {
        let _ = driver.set_sink_input_mute(*id, false);
    }
    let _ = driver.set_source_mute(monitor, false);
    let _ = driver.set_sink_mute(bus_name, false);

    match new_module {
        Ok(id) => {
            state.route_modules.insert(bus_name.to_string(), id);
            state
                .route_target
                .insert(bus_name.to_string(), target.to_string());
            report.routes_created += 1;
            trace(&format!(
                "handover done bus={} monitor={} target={}",
                bus_name, monitor, target
            ));
        }
        Err(e) => {
            warn!("failed to install loopback for {}: {}", bus_name, e);
            trace(&format!(
                "handover_error bus={} monitor={} target={} err={}",
                bus_name, monitor, target, e
            ));
        }
    }
}

fn apply_input_routes(config: &Config, state: &mut RuntimeState, driver: &dyn ServerDriver) {
    for route in &config.input_routes {
        if route.source.ends_with(".monitor") || !driver.source_exists(&route.source) {
            continue;
        }
        if !driver.sink_exists(&route.target_bus) {
            continue;
        }

        if driver.loopback_exists(&route.source, &route.target_bus) {
            state
                .input_route_target
                .insert(route.source.clone(), route.target_bus.clone());
            driver.cleanup_wrong_loopbacks_for_source(&route.source, &route.target_bus);
            continue;
        }

        let prev_target = state.input_route_target.get(&route.source).cloned();
        if prev_target.as_deref() != Some(route.target_bus.as_str()) {
            if let Some(prev_module) = state.input_route_modules.get(&route.source).copied() {
                let _ = driver.unload_module(prev_module);
            }
        }

        driver.cleanup_wrong_loopbacks_for_source(&route.source, &route.target_bus);
        match driver.load_loopback(&route.source, &route.target_bus, LOOPBACK_LATENCY_MS) {
            Ok(id) => {
                state.input_route_modules.insert(route.source.clone(), id);
                state
                    .input_route_target
                    .insert(route.source.clone(), route.target_bus.clone());
            }
            Err(e) => warn!("failed to install input route for {}: {}", route.source, e),
        }
    }
}

fn apply_stream_rules(config: &Config, driver: &dyn ServerDriver, report: &mut ReconcileReport) {
    let sink_ids: std::collections::HashMap<String, u32> = driver
        .list_sinks()
        .into_iter()
        .map(|s| (s.name, s.id))
        .collect();

    for stream in driver.list_sink_inputs() {
        let mut matched = false;
        for rule in &config.rules {
            if !rule.match_.matches(&stream.props) {
                continue;
            }
            let Some(&target_id) = sink_ids.get(&rule.target_bus) else {
                continue;
            };
            matched = true;
            if stream.attached_id != Some(target_id) {
                if driver.move_sink_input(stream.id, &rule.target_bus).is_ok() {
                    report.streams_moved += 1;
                }
            }
            break;
        }

        if !matched && is_system_stream(&stream.props) {
            if let Some(&system_id) = sink_ids.get(SYSTEM_BUS_NAME) {
                if stream.attached_id != Some(system_id) {
                    trace(&format!(
                        "system_stream_detected sink_input={} sink_id={:?}",
                        stream.id, stream.attached_id
                    ));
                    if driver.move_sink_input(stream.id, SYSTEM_BUS_NAME).is_ok() {
                        report.streams_moved += 1;
                    } else {
                        trace(&format!(
                            "system_stream_move_error sink_input={}",
                            stream.id
                        ));
                    }
                }
            }
        }
    }
}

fn apply_mic_rules(config: &Config, driver: &dyn ServerDriver, report: &mut ReconcileReport) {
    let source_ids: std::collections::HashMap<String, u32> = driver
        .list_sources()
        .into_iter()
        .map(|s| (s.name, s.id))
        .collect();

    for stream in driver.list_source_outputs() {
        for rule in &config.mic_routes {
            if !rule.match_.matches(&stream.props) {
                continue;
            }
            let monitor = format!("{}.monitor", rule.target_bus);
            let Some(&target_id) = source_ids.get(&monitor) else {
                continue;
            };
            if stream.attached_id != Some(target_id) {
                if driver.move_source_output(stream.id, &monitor).is_ok() {
                    report.streams_moved += 1;
                }
            }
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bus, MicRule, StreamMatch, StreamRule};
    use crate::server_driver::test_support::FakeDriver;

    #[test]
    fn no_default_sink_falls_back_to_first_physical_sink() {
        let driver = FakeDriver::new().with_sink("alsa_output.hw0");
        let config = Config {
            buses: vec![Bus {
                name: "vsink.browser".to_string(),
                label: "Browser".to_string(),
                route_to: RouteTarget::Default,
            }],
            ..Default::default()
        };
        let mut state = RuntimeState::default();

        reconcile(&config, &mut state, &driver);
        assert_eq!(
            state.route_target.get("vsink.browser").unwrap(),
            "alsa_output.hw0"
        );
    }

    #[test]
    fn basic_route_creates_sink_and_loopback() {
        let driver = FakeDriver::new().with_default_sink("alsa_output.hw0");
        let config = Config {
            buses: vec![Bus {
                name: "vsink.browser".to_string(),
                label: "Browser".to_string(),
                route_to: RouteTarget::Default,
            }],
            ..Default::default()
        };
        let mut state = RuntimeState::default();

        reconcile(&config, &mut state, &driver);
        assert!(state.bus_modules.contains_key("vsink.browser"));
        assert!(state.route_modules.contains_key("vsink.browser"));
        assert_eq!(
            state.route_target.get("vsink.browser").unwrap(),
            "alsa_output.hw0"
        );

        let commands_before = driver.command_count();
        reconcile(&config, &mut state, &driver);
        assert_eq!(
            driver.command_count(),
            commands_before,
            "second reconcile must issue no mutating commands"
        );
    }

    #[test]
    fn target_change_replaces_loopback() {
        let driver = FakeDriver::new()
            .with_default_sink("alsa_output.hw0")
            .with_sink("alsa_output.hw1");
        let mut config = Config {
            buses: vec![Bus {
                name: "vsink.browser".to_string(),
                label: "Browser".to_string(),
                route_to: RouteTarget::Default,
            }],
            ..Default::default()
        };
        let mut state = RuntimeState::default();
        reconcile(&config, &mut state, &driver);

        config.buses[0].route_to = RouteTarget::Sink("alsa_output.hw1".to_string());
        reconcile(&config, &mut state, &driver);

        assert_eq!(
            state.route_target.get("vsink.browser").unwrap(),
            "alsa_output.hw1"
        );
        assert_eq!(driver.loopback_count_for_sink("alsa_output.hw0"), 0);
        assert_eq!(driver.loopback_count_for_sink("alsa_output.hw1"), 1);
    }

    #[test]
    fn rule_based_routing_moves_matching_stream() {
        let driver = FakeDriver::new().with_default_sink("alsa_output.hw0");
        let config = Config {
            buses: vec![Bus {
                name: "vsink.browser".to_string(),
                label: "Browser".to_string(),
                route_to: RouteTarget::Default,
            }],
            rules: vec![StreamRule {
                match_: StreamMatch {
                    binary: Some("vivaldi".to_string()),
                    ..Default::default()
                },
                target_bus: "vsink.browser".to_string(),
            }],
            ..Default::default()
        };
        let mut state = RuntimeState::default();
        reconcile(&config, &mut state, &driver);

        driver.add_sink_input_on(
            "alsa_output.hw0",
            &[("application.process.binary", "/usr/bin/vivaldi-bin")],
        );
        reconcile(&config, &mut state, &driver);

        assert_eq!(
            driver.sink_input_attached_sink(0),
            Some("vsink.browser".to_string())
        );
    }

    #[test]
    fn system_sound_falls_back_to_system_bus() {
        let driver = FakeDriver::new().with_default_sink("alsa_output.hw0");
        let config = Config {
            buses: vec![Bus {
                name: SYSTEM_BUS_NAME.to_string(),
                label: "System".to_string(),
                route_to: RouteTarget::Default,
            }],
            ..Default::default()
        };
        let mut state = RuntimeState::default();
        reconcile(&config, &mut state, &driver);

        driver.add_sink_input_on("alsa_output.hw0", &[("media.role", "event")]);
        reconcile(&config, &mut state, &driver);

        assert_eq!(
            driver.sink_input_attached_sink(0),
            Some(SYSTEM_BUS_NAME.to_string())
        );
    }

    #[test]
    fn stale_module_recovery_does_not_error() {
        let driver = FakeDriver::new().with_default_sink("alsa_output.hw0");
        let config = Config {
            buses: vec![Bus {
                name: "vsink.podcast".to_string(),
                label: "Podcast".to_string(),
                route_to: RouteTarget::Default,
            }],
            ..Default::default()
        };
        let mut state = RuntimeState::default();
        state.bus_modules.insert("vsink.podcast".to_string(), 42);

        reconcile(&config, &mut state, &driver);
        assert_ne!(*state.bus_modules.get("vsink.podcast").unwrap(), 42);
    }

    #[test]
    fn empty_match_rule_never_fires() {
        let driver = FakeDriver::new().with_default_sink("alsa_output.hw0");
        let config = Config {
            buses: vec![Bus {
                name: "vsink.browser".to_string(),
                label: "Browser".to_string(),
                route_to: RouteTarget::Default,
            }],
            rules: vec![StreamRule {
                match_: StreamMatch::default(),
                target_bus: "vsink.browser".to_string(),
            }],
            ..Default::default()
        };
        let mut state = RuntimeState::default();
        reconcile(&config, &mut state, &driver);

        driver.add_sink_input_on("alsa_output.hw0", &[("application.name", "Anything")]);
        reconcile(&config, &mut state, &driver);

        assert_eq!(
            driver.sink_input_attached_sink(0),
            Some("alsa_output.hw0".to_string())
        );
    }

    #[test]
    fn mic_rule_moves_source_output_to_bus_monitor() {
        let driver = FakeDriver::new().with_default_sink("alsa_output.hw0");
        let config = Config {
            buses: vec![Bus {
                name: "vsink.mic".to_string(),
                label: "Mic bus".to_string(),
                route_to: RouteTarget::None,
            }],
            mic_routes: vec![MicRule {
                match_: StreamMatch {
                    app: Some("discord".to_string()),
                    ..Default::default()
                },
                target_bus: "vsink.mic".to_string(),
            }],
            ..Default::default()
        };
        let mut state = RuntimeState::default();
        reconcile(&config, &mut state, &driver);

        driver.add_source_output_on("default.monitor", &[("application.name", "Discord")]);
        reconcile(&config, &mut state, &driver);

        assert_eq!(
            driver.source_output_attached_source(0),
            Some("vsink.mic.monitor".to_string())
        );
    }

    #[test]
    fn new_null_sink_without_monitor_yet_defers_route() {
        let driver = FakeDriver::new()
            .with_default_sink("alsa_output.hw0")
            .without_monitor_on_create();
        let config = Config {
            buses: vec![Bus {
                name: "vsink.browser".to_string(),
                label: "Browser".to_string(),
                route_to: RouteTarget::Default,
            }],
            ..Default::default()
        };
        let mut state = RuntimeState::default();
        reconcile(&config, &mut state, &driver);
        assert!(!state.route_modules.contains_key("vsink.browser"));
    }
}
