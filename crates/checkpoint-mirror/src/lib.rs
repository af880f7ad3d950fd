// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Keeps a bounded local mirror of the most recently published checkpoint windows.

pub mod config;
pub mod credentials;
mod metrics;
pub mod store;
mod syncer;
mod types;

pub use config::{MirrorConfig, RegistryConfig};
pub use credentials::{CredentialResolver, Credentials};
pub use store::{CheckpointStore, ObjectStoreCheckpoints, StoreError};
pub use syncer::{CheckpointSyncer, CycleReport};
pub use types::{RetentionBudget, WindowId};
