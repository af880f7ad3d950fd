// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Checkpoint mirror configuration.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, ensure};
use mirror_utils::config::{LoadConfig, expand_home_dir, resolve_home_dir, resolve_home_dir_option};
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, DurationSecondsWithFrac, serde_as};

use crate::types::RetentionBudget;

/// Names of the environment variables that override the configuration.
pub mod env {
    /// Seconds between two sync cycles (float).
    pub const POLL_INTERVAL: &str = "CKPT_MIRROR_POLL_INTERVAL";
    /// Seconds to wait after a failed sync cycle (float).
    pub const ERROR_BACKOFF: &str = "CKPT_MIRROR_ERROR_BACKOFF";
    /// Number of windows kept locally.
    pub const KEEP_LIMIT: &str = "CKPT_MIRROR_KEEP";
    /// Distance between consecutive window identifiers.
    pub const WINDOW_STRIDE: &str = "CKPT_MIRROR_WINDOW_STRIDE";
    /// Directory holding the local checkpoint copies.
    pub const CACHE_ROOT: &str = "CKPT_MIRROR_CACHE_ROOT";
    /// Whether to look up the producer bucket in the trusted registry first.
    pub const USE_TRUSTED_BUCKET: &str = "CKPT_MIRROR_USE_TRUSTED_BUCKET";
    /// Base URL of the trusted bucket registry.
    pub const REGISTRY_URL: &str = "CKPT_MIRROR_REGISTRY_URL";
    /// Network name passed to the registry.
    pub const REGISTRY_NETWORK: &str = "CKPT_MIRROR_REGISTRY_NETWORK";
    /// Subnet identifier passed to the registry.
    pub const REGISTRY_NETUID: &str = "CKPT_MIRROR_REGISTRY_NETUID";
    /// Identifier of the producer whose bucket is looked up.
    pub const REGISTRY_PRODUCER_UID: &str = "CKPT_MIRROR_REGISTRY_PRODUCER_UID";
    /// YAML file with static storage credentials.
    pub const CREDENTIALS_PATH: &str = "CKPT_MIRROR_CREDENTIALS_PATH";
}

/// Configuration of the checkpoint mirror.
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MirrorConfig {
    /// Directory in which the local checkpoint copies are kept.
    #[serde(deserialize_with = "resolve_home_dir")]
    pub cache_root: PathBuf,
    /// Prefix under which the producer publishes `checkpoint-<window>` directories.
    pub remote_prefix: String,
    /// Custom S3 endpoint. Derived from the account id when unset.
    pub remote_endpoint: Option<String>,
    /// Time between two sync cycles.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(rename = "poll_interval_secs")]
    pub poll_interval: Duration,
    /// Time to wait after a sync cycle failed before starting the next one.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(rename = "error_backoff_secs")]
    pub error_backoff: Duration,
    /// How long a negative readiness answer is reused before asking the remote again.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "readiness_cache_ttl_secs")]
    pub readiness_cache_ttl: Duration,
    /// Timeout applied to every request against remote storage.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "request_timeout_secs")]
    pub request_timeout: Duration,
    /// Number of most recent windows kept locally.
    pub keep_limit: u64,
    /// Windows beyond `keep_limit` that are still eligible for download.
    pub safety_margin: u64,
    /// Distance between two consecutive window identifiers.
    pub window_stride: u64,
    /// Whether to resolve the bucket through the trusted registry before local credentials.
    pub use_trusted_bucket: bool,
    /// Trusted registry used to look up the producer bucket.
    pub registry: Option<RegistryConfig>,
    /// YAML file containing static storage credentials.
    #[serde(deserialize_with = "resolve_home_dir_option")]
    pub credentials_path: Option<PathBuf>,
    /// Address on which Prometheus metrics are served, if any.
    pub metrics_address: Option<SocketAddr>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            cache_root: defaults::cache_root(),
            remote_prefix: defaults::REMOTE_PREFIX.to_owned(),
            remote_endpoint: None,
            poll_interval: defaults::POLL_INTERVAL,
            error_backoff: defaults::ERROR_BACKOFF,
            readiness_cache_ttl: defaults::READINESS_CACHE_TTL,
            request_timeout: defaults::REQUEST_TIMEOUT,
            keep_limit: defaults::KEEP_LIMIT,
            safety_margin: defaults::SAFETY_MARGIN,
            window_stride: defaults::WINDOW_STRIDE,
            use_trusted_bucket: true,
            registry: None,
            credentials_path: None,
            metrics_address: None,
        }
    }
}

impl LoadConfig for MirrorConfig {}

impl MirrorConfig {
    /// Returns the retention budget described by this configuration.
    pub fn budget(&self) -> RetentionBudget {
        RetentionBudget::new(self.keep_limit, self.safety_margin, self.window_stride)
    }

    /// Applies the overrides found in the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`, which maps a variable name to its value.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(env::POLL_INTERVAL) {
            self.poll_interval = parse_seconds(env::POLL_INTERVAL, &value)?;
        }
        if let Some(value) = lookup(env::ERROR_BACKOFF) {
            self.error_backoff = parse_seconds(env::ERROR_BACKOFF, &value)?;
        }
        if let Some(value) = lookup(env::KEEP_LIMIT) {
            self.keep_limit = parse_number(env::KEEP_LIMIT, &value)?;
        }
        if let Some(value) = lookup(env::WINDOW_STRIDE) {
            self.window_stride = parse_number(env::WINDOW_STRIDE, &value)?;
        }
        if let Some(value) = lookup(env::CACHE_ROOT) {
            self.cache_root = expand_home_dir(value)?;
        }
        if let Some(value) = lookup(env::USE_TRUSTED_BUCKET) {
            self.use_trusted_bucket = parse_flag(&value);
        }
        if let Some(value) = lookup(env::CREDENTIALS_PATH) {
            self.credentials_path = Some(expand_home_dir(value)?);
        }

        if let Some(url) = lookup(env::REGISTRY_URL) {
            match self.registry.as_mut() {
                Some(registry) => registry.url = url,
                None => self.registry = Some(RegistryConfig::new(url)),
            }
        }
        if let Some(registry) = self.registry.as_mut() {
            if let Some(network) = lookup(env::REGISTRY_NETWORK) {
                registry.network = network;
            }
            if let Some(value) = lookup(env::REGISTRY_NETUID) {
                registry.netuid = parse_number(env::REGISTRY_NETUID, &value)?;
            }
            if let Some(value) = lookup(env::REGISTRY_PRODUCER_UID) {
                registry.producer_uid = parse_number(env::REGISTRY_PRODUCER_UID, &value)?;
            }
        }
        Ok(())
    }

    /// Checks that the configuration can drive the syncer.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.keep_limit > 0, "keep_limit must be at least 1");
        ensure!(self.window_stride > 0, "window_stride must be at least 1");
        ensure!(!self.poll_interval.is_zero(), "poll interval must be positive");
        Ok(())
    }
}

/// Location of the trusted registry and the producer to look up in it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Base URL of the registry service.
    pub url: String,
    /// Network the producer is registered on.
    #[serde(default = "defaults::registry_network")]
    pub network: String,
    /// Subnet the producer is registered on.
    #[serde(default)]
    pub netuid: u16,
    /// Identifier of the producer within the subnet.
    #[serde(default)]
    pub producer_uid: u16,
}

impl RegistryConfig {
    /// Creates a registry configuration with default network and identifiers.
    pub fn new(url: String) -> Self {
        Self {
            url,
            network: defaults::registry_network(),
            netuid: 0,
            producer_uid: 0,
        }
    }
}

/// Default configuration values.
pub mod defaults {
    use std::{path::PathBuf, time::Duration};

    use mirror_utils::config::expand_home_dir;

    /// Default remote prefix of the published checkpoints.
    pub const REMOTE_PREFIX: &str = "checkpoints";
    /// Default time between sync cycles.
    pub const POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default wait after a failed sync cycle.
    pub const ERROR_BACKOFF: Duration = Duration::from_secs(2);
    /// Default lifetime of a cached negative readiness answer.
    pub const READINESS_CACHE_TTL: Duration = Duration::from_secs(10);
    /// Default per-request timeout against remote storage.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
    /// Default number of windows kept locally.
    pub const KEEP_LIMIT: u64 = 5;
    /// Default number of extra windows eligible for download.
    pub const SAFETY_MARGIN: u64 = 2;
    /// Default distance between window identifiers.
    pub const WINDOW_STRIDE: u64 = 50;

    /// Returns the default cache directory, `~/.cache/checkpoint-mirror`.
    pub fn cache_root() -> PathBuf {
        expand_home_dir("~/.cache/checkpoint-mirror")
            .unwrap_or_else(|_| std::env::temp_dir().join("checkpoint-mirror"))
    }

    /// Returns the default registry network.
    pub fn registry_network() -> String {
        "finney".to_owned()
    }
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration> {
    let seconds: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a number of seconds, got {value:?}"))?;
    Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("{key} must be a non-negative number of seconds"))
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be an integer, got {value:?}"))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = MirrorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.keep_limit, 5);
        assert!(config.use_trusted_bucket);
        assert_eq!(config.budget(), RetentionBudget::new(5, 2, 50));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn yaml_fields_are_optional() -> Result<()> {
        let config: MirrorConfig = serde_yaml::from_str(concat!(
            "cache_root: /var/lib/mirror\n",
            "poll_interval_secs: 12.5\n",
            "keep_limit: 3\n",
            "registry:\n",
            "  url: http://registry.local\n",
            "  netuid: 81\n",
        ))?;
        assert_eq!(config.cache_root, PathBuf::from("/var/lib/mirror"));
        assert_eq!(config.poll_interval, Duration::from_millis(12_500));
        assert_eq!(config.keep_limit, 3);
        assert_eq!(config.error_backoff, defaults::ERROR_BACKOFF);
        let registry = config.registry.expect("registry is set");
        assert_eq!(registry.netuid, 81);
        assert_eq!(registry.network, "finney");
        Ok(())
    }

    #[test]
    fn env_overrides_replace_file_values() -> Result<()> {
        let mut config = MirrorConfig::default();
        config.apply_overrides_from(lookup_from(&[
            (env::POLL_INTERVAL, "7.5"),
            (env::KEEP_LIMIT, "9"),
            (env::USE_TRUSTED_BUCKET, "off"),
            (env::CACHE_ROOT, "/srv/checkpoints"),
            (env::REGISTRY_URL, "http://registry.local"),
            (env::REGISTRY_PRODUCER_UID, "12"),
        ]))?;

        assert_eq!(config.poll_interval, Duration::from_millis(7_500));
        assert_eq!(config.keep_limit, 9);
        assert!(!config.use_trusted_bucket);
        assert_eq!(config.cache_root, PathBuf::from("/srv/checkpoints"));
        let registry = config.registry.expect("registry is set from the environment");
        assert_eq!(registry.url, "http://registry.local");
        assert_eq!(registry.producer_uid, 12);
        Ok(())
    }

    #[test]
    fn boolean_like_flags() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_flag(value), "{value:?} should enable the flag");
        }
        for value in ["0", "false", "no", "off", ""] {
            assert!(!parse_flag(value), "{value:?} should disable the flag");
        }
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let mut config = MirrorConfig::default();
        assert!(
            config
                .apply_overrides_from(lookup_from(&[(env::KEEP_LIMIT, "five")]))
                .is_err()
        );
        assert!(
            config
                .apply_overrides_from(lookup_from(&[(env::POLL_INTERVAL, "-1")]))
                .is_err()
        );
    }

    #[test]
    fn zero_stride_is_invalid() {
        let config = MirrorConfig {
            window_stride: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
