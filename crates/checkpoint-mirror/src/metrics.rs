// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Metrics for the checkpoint syncer.

use prometheus::{
    Histogram,
    IntCounter,
    IntCounterVec,
    IntGauge,
    Registry,
    register_histogram_with_registry,
    register_int_counter_vec_with_registry,
    register_int_counter_with_registry,
    register_int_gauge_with_registry,
};

#[derive(Clone, Debug)]
pub(crate) struct SyncMetrics {
    /// Windows materialized locally.
    pub windows_downloaded: IntCounter,
    /// Failed window downloads, by reason.
    pub download_failures: IntCounterVec,
    /// Newest window seen in remote storage.
    pub latest_remote_window: IntGauge,
    /// Windows recorded as downloaded by this process.
    pub downloaded_windows: IntGauge,
    /// Local windows deleted by retention.
    pub windows_pruned: IntCounter,
    /// Failed listings of the remote catalog.
    pub listing_failures: IntCounter,
    /// Sync cycles that failed as a whole.
    pub cycle_errors: IntCounter,
    /// Duration of completed sync cycles, including those that skipped a failed listing.
    pub cycle_duration_seconds: Histogram,
}

impl SyncMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            windows_downloaded: register_int_counter_with_registry!(
                "checkpoint_mirror_windows_downloaded",
                "Number of checkpoint windows materialized locally",
                registry,
            )
            .expect("this is a valid metrics registration"),
            download_failures: register_int_counter_vec_with_registry!(
                "checkpoint_mirror_download_failures",
                "Number of failed checkpoint window downloads",
                &["reason"],
                registry,
            )
            .expect("this is a valid metrics registration"),
            latest_remote_window: register_int_gauge_with_registry!(
                "checkpoint_mirror_latest_remote_window",
                "Newest checkpoint window visible in remote storage",
                registry,
            )
            .expect("this is a valid metrics registration"),
            downloaded_windows: register_int_gauge_with_registry!(
                "checkpoint_mirror_downloaded_windows",
                "Number of windows recorded as downloaded",
                registry,
            )
            .expect("this is a valid metrics registration"),
            windows_pruned: register_int_counter_with_registry!(
                "checkpoint_mirror_windows_pruned",
                "Number of local checkpoint windows removed by retention",
                registry,
            )
            .expect("this is a valid metrics registration"),
            listing_failures: register_int_counter_with_registry!(
                "checkpoint_mirror_listing_failures",
                "Number of failed listings of the remote checkpoint catalog",
                registry,
            )
            .expect("this is a valid metrics registration"),
            cycle_errors: register_int_counter_with_registry!(
                "checkpoint_mirror_cycle_errors",
                "Number of sync cycles that failed",
                registry,
            )
            .expect("this is a valid metrics registration"),
            cycle_duration_seconds: register_histogram_with_registry!(
                "checkpoint_mirror_cycle_duration_seconds",
                "Duration of sync cycles that ran to completion, including cycles whose remote listing \
                 failed and was skipped; cycles that failed as a whole are not observed",
                registry,
            )
            .expect("this is a valid metrics registration"),
        }
    }
}
