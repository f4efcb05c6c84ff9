// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reconciliation engine for PipeWire/PulseAudio virtual bus routing.
//!
//! The crate is split into the persistence layer ([`config_store`],
//! [`state_store`]), the server control layer ([`server_driver`]), and the
//! decision layer ([`model`], [`classifier`], [`reconciler`],
//! [`fast_path`]) consumed by the `audiorouter-daemon` binary.

pub mod classifier;
pub mod config_store;
pub mod fast_path;
pub mod model;
pub mod reconciler;
pub mod server_driver;
pub mod state_store;
pub mod trace;

pub use config_store::{ConfigError, ConfigStore};
pub use model::{
    Bus, CompanionConfig, Config, InputRoute, MicRule, RouteTarget, RuntimeState, StreamMatch,
    StreamRule, SYSTEM_BUS_NAME,
};
pub use reconciler::{reconcile, ReconcileReport};
pub use server_driver::{sandboxed_command, PactlDriver, ServerDriver};
pub use state_store::StateStore;
