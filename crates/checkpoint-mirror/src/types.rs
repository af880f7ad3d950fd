// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Types shared by the store and the syncer.

use std::ops::RangeInclusive;

/// Identifier of one published checkpoint batch.
///
/// Window identifiers are spaced by a fixed stride and only their ordering is relied upon.
pub type WindowId = u64;

/// Bounds both which windows may be downloaded and which local copies are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionBudget {
    /// Number of most recent windows kept locally.
    pub keep_limit: u64,
    /// Extra windows beyond `keep_limit` that are still eligible for download.
    pub safety_margin: u64,
    /// Distance between two consecutive window identifiers.
    pub stride: u64,
}

impl RetentionBudget {
    /// Creates a new budget.
    pub fn new(keep_limit: u64, safety_margin: u64, stride: u64) -> Self {
        Self {
            keep_limit,
            safety_margin,
            stride,
        }
    }

    /// Returns the oldest window that may still be downloaded when `latest` is the newest remote
    /// window.
    pub fn download_cutoff(&self, latest: WindowId) -> WindowId {
        let span = self
            .keep_limit
            .saturating_add(self.safety_margin)
            .saturating_mul(self.stride);
        latest.saturating_sub(span)
    }

    /// Returns the windows that are eligible for download, oldest first.
    pub fn eligible(&self, latest: WindowId) -> RangeInclusive<WindowId> {
        self.download_cutoff(latest)..=latest
    }

    /// Returns true if a local copy of `window` must be kept when `latest` is the newest remote
    /// window.
    ///
    /// Windows newer than `latest` are always retained.
    pub fn retains(&self, window: WindowId, latest: WindowId) -> bool {
        let span = self.keep_limit.saturating_mul(self.stride);
        match latest.checked_sub(span) {
            Some(oldest_excluded) => window > oldest_excluded,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_includes_safety_margin() {
        let budget = RetentionBudget::new(5, 2, 100);
        assert_eq!(budget.download_cutoff(1000), 300);

        let eligible = budget.eligible(1000);
        assert!(!eligible.contains(&200));
        assert!(eligible.contains(&300));
        assert!(eligible.contains(&600));
        assert!(eligible.contains(&1000));
    }

    #[test]
    fn cutoff_saturates_near_zero() {
        let budget = RetentionBudget::new(5, 2, 100);
        assert_eq!(budget.download_cutoff(250), 0);
        assert!(budget.eligible(250).contains(&0));
    }

    #[test]
    fn retains_keep_limit_most_recent_windows() {
        let budget = RetentionBudget::new(3, 2, 10);
        let retained: Vec<_> = (0..=100)
            .step_by(10)
            .filter(|window| budget.retains(*window, 100))
            .collect();
        assert_eq!(retained, vec![80, 90, 100]);
        assert!(budget.retains(110, 100));
    }

    #[test]
    fn young_catalog_retains_everything() {
        let budget = RetentionBudget::new(5, 2, 10);
        assert!(budget.retains(0, 20));
        assert!(budget.retains(10, 20));
    }
}
