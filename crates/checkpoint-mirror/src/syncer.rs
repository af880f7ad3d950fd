// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Polling loop that keeps the local mirror in sync with the remote catalog.

use std::{collections::BTreeSet, time::Duration};

use prometheus::Registry;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::MirrorConfig,
    metrics::SyncMetrics,
    store::CheckpointStore,
    types::{RetentionBudget, WindowId},
};

/// Outcome of a single synchronization cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Newest window in the remote catalog, `None` if the catalog was empty.
    pub latest: Option<WindowId>,
    /// Remote windows within the download cutoff, oldest first.
    pub eligible: Vec<WindowId>,
    /// Windows newly materialized during this cycle.
    pub downloaded: Vec<WindowId>,
}

/// Mirrors the most recent remote checkpoint windows into local storage.
///
/// The set of downloaded windows only grows for the lifetime of the syncer. A window that was
/// downloaded and later pruned locally is not fetched again.
#[derive(Debug)]
pub struct CheckpointSyncer<S> {
    store: S,
    budget: RetentionBudget,
    poll_interval: Duration,
    error_backoff: Duration,
    downloaded: BTreeSet<WindowId>,
    prune_anchor: Option<WindowId>,
    metrics: SyncMetrics,
}

impl<S: CheckpointStore> CheckpointSyncer<S> {
    /// Creates a new syncer and registers its metrics on `registry`.
    pub fn new(
        store: S,
        budget: RetentionBudget,
        poll_interval: Duration,
        error_backoff: Duration,
        registry: &Registry,
    ) -> Self {
        Self {
            store,
            budget,
            poll_interval,
            error_backoff,
            downloaded: BTreeSet::new(),
            prune_anchor: None,
            metrics: SyncMetrics::new(registry),
        }
    }

    /// Creates a new syncer with the timing and budget of `config`.
    pub fn from_config(store: S, config: &MirrorConfig, registry: &Registry) -> Self {
        Self::new(
            store,
            config.budget(),
            config.poll_interval,
            config.error_backoff,
            registry,
        )
    }

    /// Returns the windows downloaded so far.
    pub fn downloaded(&self) -> &BTreeSet<WindowId> {
        &self.downloaded
    }

    /// Runs synchronization cycles until `cancellation_token` is cancelled.
    ///
    /// Cancellation is observed before each cycle and while sleeping between cycles; a cycle that
    /// is in progress runs to completion.
    pub async fn run(&mut self, cancellation_token: CancellationToken) {
        tracing::info!(
            poll_interval = ?self.poll_interval,
            keep_limit = self.budget.keep_limit,
            stride = self.budget.stride,
            "starting checkpoint syncer"
        );

        let mut consecutive_failures: u32 = 0;
        while !cancellation_token.is_cancelled() {
            let started = Instant::now();
            let delay = match self.run_cycle().await {
                Ok(report) => {
                    consecutive_failures = 0;
                    self.metrics
                        .cycle_duration_seconds
                        .observe(started.elapsed().as_secs_f64());
                    tracing::debug!(
                        latest = ?report.latest,
                        eligible = report.eligible.len(),
                        downloaded = ?report.downloaded,
                        "sync cycle complete"
                    );
                    self.poll_interval
                }
                Err(error) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.metrics.cycle_errors.inc();
                    tracing::warn!(consecutive_failures, ?error, "sync cycle failed");
                    self.error_backoff
                }
            };

            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => (),
            }
        }
        tracing::info!("checkpoint syncer stopped");
    }

    /// Runs a single synchronization cycle.
    ///
    /// Listing, per-window and pruning failures are logged and do not fail the cycle. A failed
    /// listing is handled like an empty catalog, so it is retried after the regular poll interval.
    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleReport> {
        let remote = match self.store.list_remote_windows().await {
            Ok(remote) => remote,
            Err(error) => {
                self.metrics.listing_failures.inc();
                tracing::warn!(?error, "failed to list remote checkpoint windows");
                return Ok(CycleReport::default());
            }
        };

        let Some(&latest) = remote.last() else {
            tracing::debug!("no checkpoint windows published yet");
            return Ok(CycleReport::default());
        };
        self.metrics
            .latest_remote_window
            .set(i64::try_from(latest).unwrap_or(i64::MAX));

        let eligible: Vec<WindowId> = remote
            .range(self.budget.eligible(latest))
            .copied()
            .collect();
        tracing::trace!(latest, ?eligible, "selected windows to mirror");

        let mut downloaded = vec![];
        for &window in &eligible {
            if self.downloaded.contains(&window) {
                continue;
            }
            if self.download_one(window).await {
                downloaded.push(window);
            }
        }

        self.prune(latest).await;

        Ok(CycleReport {
            latest: Some(latest),
            eligible,
            downloaded,
        })
    }

    /// Makes sure `window` is present locally and returns whether it is.
    ///
    /// Windows that are not published yet are skipped quietly; they are retried in later cycles.
    pub async fn download_one(&mut self, window: WindowId) -> bool {
        if self.downloaded.contains(&window) {
            return true;
        }

        match self.store.is_ready(window).await {
            Ok(true) => (),
            Ok(false) => {
                tracing::debug!(window, "checkpoint window not ready yet");
                return false;
            }
            Err(error) => {
                self.metrics
                    .download_failures
                    .with_label_values(&["error"])
                    .inc();
                tracing::warn!(window, ?error, "failed to check checkpoint window readiness");
                return false;
            }
        }

        if let Err(error) = self.store.invalidate_read_cache().await {
            tracing::debug!(window, ?error, "failed to invalidate the read cache");
        }

        match self.store.fetch(window).await {
            Ok(Some(path)) => {
                self.downloaded.insert(window);
                self.metrics.windows_downloaded.inc();
                self.metrics
                    .downloaded_windows
                    .set(i64::try_from(self.downloaded.len()).unwrap_or(i64::MAX));
                tracing::info!(window, path = %path.display(), "downloaded checkpoint window");
                true
            }
            Ok(None) => {
                self.metrics
                    .download_failures
                    .with_label_values(&["not_ready"])
                    .inc();
                tracing::warn!(window, "checkpoint window vanished or became unready before fetch");
                false
            }
            Err(error) => {
                self.metrics
                    .download_failures
                    .with_label_values(&["error"])
                    .inc();
                tracing::warn!(window, ?error, "failed to download checkpoint window");
                false
            }
        }
    }

    async fn prune(&mut self, latest: WindowId) {
        let anchor = self.prune_anchor.map_or(latest, |anchor| anchor.max(latest));
        self.prune_anchor = Some(anchor);

        match self.store.prune_local(anchor).await {
            Ok(removed) if removed.is_empty() => (),
            Ok(removed) => {
                self.metrics
                    .windows_pruned
                    .inc_by(u64::try_from(removed.len()).unwrap_or(u64::MAX));
                tracing::debug!(anchor, ?removed, "pruned local checkpoint windows");
            }
            Err(error) => {
                tracing::debug!(anchor, ?error, "failed to prune local checkpoint windows");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{Arc, Mutex},
    };

    use mockall::{Sequence, predicate::eq};

    use super::*;
    use crate::store::{MockCheckpointStore, StoreError};

    const BUDGET: RetentionBudget = RetentionBudget {
        keep_limit: 5,
        safety_margin: 2,
        stride: 100,
    };

    fn syncer(store: MockCheckpointStore) -> CheckpointSyncer<MockCheckpointStore> {
        CheckpointSyncer::new(
            store,
            BUDGET,
            Duration::from_secs(30),
            Duration::from_secs(2),
            &Registry::new(),
        )
    }

    fn io_error() -> StoreError {
        StoreError::Io(std::io::Error::other("connection reset"))
    }

    fn local_path(window: WindowId) -> PathBuf {
        PathBuf::from(format!("/cache/checkpoint-{window}"))
    }

    /// Expects the store to accept pruning and cache invalidation any number of times.
    fn allow_housekeeping(store: &mut MockCheckpointStore) {
        store.expect_invalidate_read_cache().returning(|| Ok(()));
        store.expect_prune_local().returning(|_| Ok(vec![]));
    }

    #[tokio::test]
    async fn downloads_only_windows_within_cutoff() -> anyhow::Result<()> {
        let mut store = MockCheckpointStore::new();
        store
            .expect_list_remote_windows()
            .returning(|| Ok(BTreeSet::from([200, 600, 900, 1000])));
        store.expect_is_ready().with(eq(200)).never();
        store.expect_is_ready().returning(|_| Ok(true));
        store
            .expect_fetch()
            .with(eq(200))
            .never();
        store
            .expect_fetch()
            .returning(|window| Ok(Some(local_path(window))));
        allow_housekeeping(&mut store);

        let mut syncer = syncer(store);
        let report = syncer.run_cycle().await?;

        assert_eq!(report.latest, Some(1000));
        assert_eq!(report.eligible, vec![600, 900, 1000]);
        assert_eq!(report.downloaded, vec![600, 900, 1000]);
        assert_eq!(syncer.downloaded(), &BTreeSet::from([600, 900, 1000]));
        Ok(())
    }

    #[tokio::test]
    async fn downloaded_windows_are_not_fetched_again() -> anyhow::Result<()> {
        let mut store = MockCheckpointStore::new();
        store
            .expect_list_remote_windows()
            .times(2)
            .returning(|| Ok(BTreeSet::from([900, 1000])));
        store.expect_is_ready().times(2).returning(|_| Ok(true));
        store
            .expect_fetch()
            .times(2)
            .returning(|window| Ok(Some(local_path(window))));
        allow_housekeeping(&mut store);

        let mut syncer = syncer(store);
        assert_eq!(syncer.run_cycle().await?.downloaded, vec![900, 1000]);
        assert!(syncer.run_cycle().await?.downloaded.is_empty());
        assert!(syncer.download_one(900).await);
        Ok(())
    }

    #[tokio::test]
    async fn unready_windows_are_never_fetched() -> anyhow::Result<()> {
        let mut store = MockCheckpointStore::new();
        store
            .expect_list_remote_windows()
            .returning(|| Ok(BTreeSet::from([900, 1000])));
        store.expect_is_ready().with(eq(900)).returning(|_| Ok(true));
        store.expect_is_ready().with(eq(1000)).returning(|_| Ok(false));
        store
            .expect_fetch()
            .with(eq(900))
            .times(1)
            .returning(|window| Ok(Some(local_path(window))));
        allow_housekeeping(&mut store);

        let mut syncer = syncer(store);
        let report = syncer.run_cycle().await?;

        assert_eq!(report.downloaded, vec![900]);
        assert!(!syncer.downloaded().contains(&1000));
        Ok(())
    }

    #[tokio::test]
    async fn fetch_without_path_is_retried_next_cycle() -> anyhow::Result<()> {
        let mut store = MockCheckpointStore::new();
        let mut sequence = Sequence::new();
        store
            .expect_list_remote_windows()
            .returning(|| Ok(BTreeSet::from([1000])));
        store.expect_is_ready().returning(|_| Ok(true));
        store
            .expect_fetch()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(None));
        store
            .expect_fetch()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|window| Ok(Some(local_path(window))));
        allow_housekeeping(&mut store);

        let mut syncer = syncer(store);
        assert!(syncer.run_cycle().await?.downloaded.is_empty());
        assert!(syncer.downloaded().is_empty());
        assert_eq!(syncer.run_cycle().await?.downloaded, vec![1000]);
        Ok(())
    }

    #[tokio::test]
    async fn failed_window_does_not_block_later_windows() -> anyhow::Result<()> {
        let mut store = MockCheckpointStore::new();
        store
            .expect_list_remote_windows()
            .returning(|| Ok(BTreeSet::from([800, 900, 1000])));
        store.expect_is_ready().with(eq(800)).returning(|_| Err(io_error()));
        store.expect_is_ready().returning(|_| Ok(true));
        store
            .expect_fetch()
            .with(eq(900))
            .returning(|_| Err(io_error()));
        store
            .expect_fetch()
            .with(eq(1000))
            .times(1)
            .returning(|window| Ok(Some(local_path(window))));
        allow_housekeeping(&mut store);

        let mut syncer = syncer(store);
        let report = syncer.run_cycle().await?;

        assert_eq!(report.downloaded, vec![1000]);
        assert_eq!(syncer.downloaded(), &BTreeSet::from([1000]));
        Ok(())
    }

    #[tokio::test]
    async fn prune_anchor_never_decreases() -> anyhow::Result<()> {
        let mut store = MockCheckpointStore::new();
        let mut listing = Sequence::new();
        for windows in [vec![900, 1000], vec![1000, 1100], vec![900, 1000]] {
            store
                .expect_list_remote_windows()
                .times(1)
                .in_sequence(&mut listing)
                .returning(move || Ok(windows.iter().copied().collect()));
        }
        store.expect_is_ready().returning(|_| Ok(false));

        let anchors = Arc::new(Mutex::new(vec![]));
        let recorded = anchors.clone();
        store.expect_prune_local().returning(move |latest| {
            recorded.lock().expect("not poisoned").push(latest);
            Ok(vec![])
        });

        let mut syncer = syncer(store);
        for _ in 0..3 {
            syncer.run_cycle().await?;
        }

        assert_eq!(*anchors.lock().expect("not poisoned"), vec![1000, 1100, 1100]);
        Ok(())
    }

    #[tokio::test]
    async fn pruning_follows_remote_latest_while_downloads_fail() -> anyhow::Result<()> {
        let mut store = MockCheckpointStore::new();
        store
            .expect_list_remote_windows()
            .returning(|| Ok(BTreeSet::from([900, 1000])));
        store.expect_is_ready().returning(|_| Ok(true));
        store.expect_invalidate_read_cache().returning(|| Ok(()));
        store.expect_fetch().returning(|_| Err(io_error()));
        store
            .expect_prune_local()
            .with(eq(1000))
            .times(1)
            .returning(|_| Ok(vec![300]));

        let mut syncer = syncer(store);
        assert!(syncer.run_cycle().await?.downloaded.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn empty_catalog_is_a_no_op() -> anyhow::Result<()> {
        let mut store = MockCheckpointStore::new();
        store
            .expect_list_remote_windows()
            .returning(|| Ok(BTreeSet::new()));
        store.expect_is_ready().never();
        store.expect_fetch().never();
        store.expect_prune_local().never();

        let mut syncer = syncer(store);
        assert_eq!(syncer.run_cycle().await?, CycleReport::default());
        Ok(())
    }

    #[tokio::test]
    async fn cache_invalidation_failure_is_not_fatal() {
        let mut store = MockCheckpointStore::new();
        store.expect_is_ready().returning(|_| Ok(true));
        store
            .expect_invalidate_read_cache()
            .times(1)
            .returning(|| Err(io_error()));
        store
            .expect_fetch()
            .times(1)
            .returning(|window| Ok(Some(local_path(window))));

        let mut syncer = syncer(store);
        assert!(syncer.download_one(1000).await);
    }

    #[tokio::test]
    async fn prune_failure_is_swallowed() -> anyhow::Result<()> {
        let mut store = MockCheckpointStore::new();
        store
            .expect_list_remote_windows()
            .returning(|| Ok(BTreeSet::from([1000])));
        store.expect_is_ready().returning(|_| Ok(true));
        store.expect_invalidate_read_cache().returning(|| Ok(()));
        store
            .expect_fetch()
            .returning(|window| Ok(Some(local_path(window))));
        store
            .expect_prune_local()
            .returning(|_| Err(io_error()));

        let mut syncer = syncer(store);
        assert_eq!(syncer.run_cycle().await?.downloaded, vec![1000]);
        Ok(())
    }

    #[tokio::test]
    async fn listing_failure_is_handled_like_an_empty_catalog() -> anyhow::Result<()> {
        let mut store = MockCheckpointStore::new();
        store
            .expect_list_remote_windows()
            .returning(|| Err(io_error()));
        store.expect_is_ready().never();
        store.expect_prune_local().never();

        let mut syncer = syncer(store);
        assert_eq!(syncer.run_cycle().await?, CycleReport::default());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_listing_is_retried_after_poll_interval() {
        let started = Instant::now();
        let attempts = Arc::new(Mutex::new(vec![]));
        let recorded = attempts.clone();

        let mut store = MockCheckpointStore::new();
        store.expect_list_remote_windows().returning(move || {
            let mut attempts = recorded.lock().expect("not poisoned");
            attempts.push(started.elapsed().as_secs());
            if attempts.len() == 1 {
                Err(io_error())
            } else {
                Ok(BTreeSet::from([1000]))
            }
        });
        store.expect_is_ready().returning(|_| Ok(true));
        store
            .expect_fetch()
            .times(1)
            .returning(|window| Ok(Some(local_path(window))));
        allow_housekeeping(&mut store);

        let mut syncer = syncer(store);
        let run = syncer.run(CancellationToken::new());
        let _ = tokio::time::timeout(Duration::from_secs(45), run).await;

        // The error backoff is 2s; a failed listing must still wait for the 30s poll interval.
        assert_eq!(*attempts.lock().expect("not poisoned"), vec![0, 30]);
        assert_eq!(syncer.downloaded(), &BTreeSet::from([1000]));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancellation() {
        let mut store = MockCheckpointStore::new();
        store
            .expect_list_remote_windows()
            .times(1)
            .returning(|| Ok(BTreeSet::new()));

        let mut syncer = syncer(store);
        let cancellation_token = CancellationToken::new();
        let cancel = cancellation_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        tokio::time::timeout(Duration::from_secs(10), syncer.run(cancellation_token))
            .await
            .expect("syncer stops before the next poll");
    }

    #[tokio::test]
    async fn cancelled_syncer_does_not_start_a_cycle() {
        let mut store = MockCheckpointStore::new();
        store.expect_list_remote_windows().never();

        let mut syncer = syncer(store);
        let cancellation_token = CancellationToken::new();
        cancellation_token.cancel();
        syncer.run(cancellation_token).await;
    }
}
