// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the checkpoint mirror crates.

#[cfg(feature = "config")]
pub mod config;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub mod telemetry;
