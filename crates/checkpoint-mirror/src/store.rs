// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Access to the published checkpoints and to their local copies.
//!
//! The producer publishes each window under `<prefix>/checkpoint-<window>/` and writes the
//! [`READY_MARKER`] object last. A window is materialized locally as
//! `<cache_root>/checkpoint-<window>/`, first downloaded into a staging directory and then renamed
//! into place, so a local window directory is always complete.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::{
    ClientOptions,
    ObjectMeta,
    ObjectStore,
    aws::AmazonS3Builder,
    path::Path as ObjectPath,
};
use tokio::{io::AsyncWriteExt, time::Instant};

use crate::{
    config::{MirrorConfig, defaults},
    credentials::Credentials,
    types::{RetentionBudget, WindowId},
};

/// Name of the object that marks a window as completely published.
pub const READY_MARKER: &str = "READY";

const WINDOW_DIR_PREFIX: &str = "checkpoint-";
const STAGING_DIR_PREFIX: &str = ".staging-checkpoint-";

/// Errors returned by a [`CheckpointStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A request against remote storage failed.
    #[error("remote storage request failed")]
    Remote(#[from] object_store::Error),
    /// Reading or writing the local cache failed.
    #[error("local checkpoint cache I/O failed")]
    Io(#[from] std::io::Error),
    /// The remote returned an object that cannot be mapped to a local file.
    #[error("remote object {0} cannot be stored locally")]
    InvalidObjectPath(String),
}

/// Remote checkpoint catalog together with the local copies of the checkpoints.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Lists the windows currently visible in remote storage.
    async fn list_remote_windows(&self) -> Result<BTreeSet<WindowId>, StoreError>;

    /// Returns true if `window` is completely published.
    async fn is_ready(&self, window: WindowId) -> Result<bool, StoreError>;

    /// Makes `window` available locally and returns its directory.
    ///
    /// Returns `None` if the window turns out not to be ready.
    async fn fetch(&self, window: WindowId) -> Result<Option<PathBuf>, StoreError>;

    /// Drops any cached remote reads.
    async fn invalidate_read_cache(&self) -> Result<(), StoreError>;

    /// Deletes the local windows outside the retention budget relative to `latest`.
    ///
    /// Returns the windows that were removed.
    async fn prune_local(&self, latest: WindowId) -> Result<Vec<WindowId>, StoreError>;
}

/// A [`CheckpointStore`] reading from an [`ObjectStore`] into a local directory.
#[derive(Debug)]
pub struct ObjectStoreCheckpoints {
    remote: Arc<dyn ObjectStore>,
    remote_prefix: ObjectPath,
    cache_root: PathBuf,
    budget: RetentionBudget,
    readiness_cache_ttl: Duration,
    // Windows whose ready marker was missing, with the instant until which that answer is reused.
    not_ready_until: Mutex<HashMap<WindowId, Instant>>,
}

impl ObjectStoreCheckpoints {
    /// Creates a store reading `<remote_prefix>/checkpoint-<window>/` into `cache_root`.
    pub fn new(
        remote: Arc<dyn ObjectStore>,
        remote_prefix: &str,
        cache_root: impl Into<PathBuf>,
        budget: RetentionBudget,
    ) -> Self {
        Self {
            remote,
            remote_prefix: ObjectPath::from(remote_prefix),
            cache_root: cache_root.into(),
            budget,
            readiness_cache_ttl: defaults::READINESS_CACHE_TTL,
            not_ready_until: Mutex::default(),
        }
    }

    /// Sets how long a missing ready marker is remembered.
    pub fn with_readiness_cache_ttl(mut self, ttl: Duration) -> Self {
        self.readiness_cache_ttl = ttl;
        self
    }

    /// Connects to the S3-compatible bucket described by `credentials`.
    ///
    /// Without an explicit endpoint in `config`, the Cloudflare R2 endpoint of the credentials'
    /// account is used.
    pub fn from_config(
        config: &MirrorConfig,
        credentials: &Credentials,
    ) -> Result<Self, StoreError> {
        let endpoint = config.remote_endpoint.clone().unwrap_or_else(|| {
            format!("https://{}.r2.cloudflarestorage.com", credentials.account_id)
        });
        let client_options = ClientOptions::new()
            .with_timeout(config.request_timeout)
            .with_allow_http(endpoint.starts_with("http://"));

        let remote = AmazonS3Builder::new()
            .with_bucket_name(&credentials.bucket_name)
            .with_access_key_id(&credentials.access_key_id)
            .with_secret_access_key(&credentials.secret_access_key)
            .with_endpoint(endpoint)
            .with_region("auto")
            .with_client_options(client_options)
            .build()?;

        Ok(Self::new(
            Arc::new(remote),
            &config.remote_prefix,
            config.cache_root.clone(),
            config.budget(),
        )
        .with_readiness_cache_ttl(config.readiness_cache_ttl))
    }

    /// Returns the directory holding the local windows.
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Returns the directory in which `window` is materialized.
    pub fn local_path(&self, window: WindowId) -> PathBuf {
        self.cache_root.join(format!("{WINDOW_DIR_PREFIX}{window}"))
    }

    fn staging_path(&self, window: WindowId) -> PathBuf {
        self.cache_root.join(format!("{STAGING_DIR_PREFIX}{window}"))
    }

    fn remote_window_prefix(&self, window: WindowId) -> ObjectPath {
        self.remote_prefix.child(format!("{WINDOW_DIR_PREFIX}{window}"))
    }

    async fn marker_exists(&self, window: WindowId) -> Result<bool, StoreError> {
        let marker = self.remote_window_prefix(window).child(READY_MARKER);
        match self.remote.head(&marker).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    fn cached_not_ready(&self, window: WindowId) -> bool {
        let now = Instant::now();
        let mut cache = self
            .not_ready_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        cache.retain(|_, until| *until > now);
        cache.contains_key(&window)
    }

    fn remember_not_ready(&self, window: WindowId) {
        if self.readiness_cache_ttl.is_zero() {
            return;
        }
        self.not_ready_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(window, Instant::now() + self.readiness_cache_ttl);
    }

    /// Downloads every object of `window` except the ready marker into `staging`.
    async fn download_into(&self, window: WindowId, staging: &Path) -> Result<usize, StoreError> {
        if tokio::fs::try_exists(staging).await? {
            tokio::fs::remove_dir_all(staging).await?;
        }
        tokio::fs::create_dir_all(staging).await?;

        let prefix = self.remote_window_prefix(window);
        let objects: Vec<ObjectMeta> = self.remote.list(Some(&prefix)).try_collect().await?;

        let mut downloaded = 0;
        for object in objects {
            let Some(relative) = local_relative_path(&prefix, &object.location) else {
                return Err(StoreError::InvalidObjectPath(object.location.to_string()));
            };
            if relative == Path::new(READY_MARKER) {
                continue;
            }

            let destination = staging.join(&relative);
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut stream = self.remote.get(&object.location).await?.into_stream();
            let mut file = tokio::fs::File::create(&destination).await?;
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await?;

            tracing::debug!(window, object = %object.location, size = object.size, "downloaded");
            downloaded += 1;
        }
        Ok(downloaded)
    }
}

#[async_trait]
impl CheckpointStore for ObjectStoreCheckpoints {
    async fn list_remote_windows(&self) -> Result<BTreeSet<WindowId>, StoreError> {
        let listing = self
            .remote
            .list_with_delimiter(Some(&self.remote_prefix))
            .await?;

        Ok(listing
            .common_prefixes
            .iter()
            .filter_map(|prefix| {
                let window = prefix
                    .filename()
                    .and_then(|name| parse_window(name, WINDOW_DIR_PREFIX));
                if window.is_none() {
                    tracing::trace!(%prefix, "ignoring unrelated remote prefix");
                }
                window
            })
            .collect())
    }

    async fn is_ready(&self, window: WindowId) -> Result<bool, StoreError> {
        if self.cached_not_ready(window) {
            return Ok(false);
        }
        let ready = self.marker_exists(window).await?;
        if !ready {
            self.remember_not_ready(window);
        }
        Ok(ready)
    }

    async fn fetch(&self, window: WindowId) -> Result<Option<PathBuf>, StoreError> {
        let target = self.local_path(window);
        if tokio::fs::try_exists(&target).await? {
            tracing::debug!(window, path = %target.display(), "checkpoint already present locally");
            return Ok(Some(target));
        }

        // Publication is not atomic from our point of view; check the marker right before reading.
        if !self.is_ready(window).await? {
            return Ok(None);
        }

        let staging = self.staging_path(window);
        let files = match self.download_into(window, &staging).await {
            Ok(files) => files,
            Err(error) => {
                if let Err(cleanup_error) = tokio::fs::remove_dir_all(&staging).await {
                    tracing::debug!(?cleanup_error, window, "failed to remove staging directory");
                }
                return Err(error);
            }
        };
        tokio::fs::rename(&staging, &target).await?;

        tracing::debug!(window, files, path = %target.display(), "materialized checkpoint");
        Ok(Some(target))
    }

    async fn invalidate_read_cache(&self) -> Result<(), StoreError> {
        self.not_ready_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    async fn prune_local(&self, latest: WindowId) -> Result<Vec<WindowId>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.cache_root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(error) => return Err(error.into()),
        };

        let mut removed = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let (window, staging) = if let Some(window) = parse_window(name, WINDOW_DIR_PREFIX) {
                (window, false)
            } else if let Some(window) = parse_window(name, STAGING_DIR_PREFIX) {
                (window, true)
            } else {
                continue;
            };

            if self.budget.retains(window, latest) || !entry.file_type().await?.is_dir() {
                continue;
            }

            tokio::fs::remove_dir_all(entry.path()).await?;
            tracing::debug!(window, staging, latest, "removed local checkpoint");
            if !staging {
                removed.insert(window);
            }
        }
        Ok(removed.into_iter().collect())
    }
}

fn parse_window(name: &str, prefix: &str) -> Option<WindowId> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Maps `location` below `prefix` to a relative local path, rejecting anything that could escape
/// the window directory.
fn local_relative_path(prefix: &ObjectPath, location: &ObjectPath) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for part in location.prefix_match(prefix)? {
        let part = part.as_ref();
        if part.is_empty() || part == "." || part == ".." || part.contains(['/', '\\']) {
            return None;
        }
        relative.push(part);
    }
    (!relative.as_os_str().is_empty()).then_some(relative)
}
