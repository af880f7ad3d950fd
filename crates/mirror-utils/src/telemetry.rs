// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for binaries.

use tracing_subscriber::{EnvFilter, fmt};

/// Installs a global fmt subscriber.
///
/// The filter is read from `RUST_LOG` and falls back to `default_directive` when the variable is
/// unset or invalid. Calling this more than once is harmless; later calls are ignored.
pub fn init_tracing_subscriber(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    if fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already installed");
    }
}
