// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Top-level error type for the daemon binary. Module-level errors
//! (`ServerCommandError`, `ConfigError`, ...) stay where they are defined;
//! this only exists so `main` has a single `Result` to return.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioRouterError {
    #[error("another instance is already running (pid {0})")]
    LockContention(u32),
    #[error("sound server never became reachable within the startup deadline")]
    ServerUnreachable,
    #[error(transparent)]
    Config(#[from] audiorouter::ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
