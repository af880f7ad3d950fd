// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Resolution of the storage credentials used to read the published checkpoints.
//!
//! Credentials are resolved once at startup through an ordered fallback chain: the producer's
//! bucket from a trusted registry, then static local credentials, then environment variables.
//! The chain never fails; in the worst case it yields empty credentials and the storage requests
//! fail later with their own authorization errors.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::{MirrorConfig, RegistryConfig};

/// Names of the environment variables used as the last credential fallback.
pub mod env {
    /// Bucket name.
    pub const BUCKET: &str = "CKPT_BUCKET";
    /// Storage account identifier.
    pub const ACCOUNT_ID: &str = "CKPT_ACCOUNT_ID";
    /// Access key identifier.
    pub const ACCESS_KEY: &str = "CKPT_ACCESS_KEY";
    /// Secret access key.
    pub const SECRET_KEY: &str = "CKPT_SECRET_KEY";
}

const REGISTRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to authorize reads from the checkpoint bucket.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Name of the bucket.
    #[serde(alias = "name")]
    pub bucket_name: String,
    /// Storage account identifier, used to derive the endpoint.
    pub account_id: String,
    /// Access key identifier.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bucket_name", &self.bucket_name)
            .field("account_id", &self.account_id)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Reads the credentials from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the credentials through `lookup`; unset variables become empty strings.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            bucket_name: lookup(env::BUCKET).unwrap_or_default(),
            account_id: lookup(env::ACCOUNT_ID).unwrap_or_default(),
            access_key_id: lookup(env::ACCESS_KEY).unwrap_or_default(),
            secret_access_key: lookup(env::SECRET_KEY).unwrap_or_default(),
        }
    }
}

/// Looks up the bucket of the designated producer in a trusted registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BucketRegistry: fmt::Debug + Send + Sync {
    /// Returns the producer's bucket, or `None` if the producer has not registered one.
    async fn producer_bucket(&self) -> anyhow::Result<Option<Credentials>>;
}

/// Loads statically provisioned local credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialLoader: fmt::Debug + Send + Sync {
    /// Loads the credentials.
    async fn load(&self) -> anyhow::Result<Credentials>;
}

/// A [`BucketRegistry`] backed by an HTTP JSON registry service.
#[derive(Debug, Clone)]
pub struct RestBucketRegistry {
    client: reqwest::Client,
    config: RegistryConfig,
}

impl RestBucketRegistry {
    /// Creates a registry client for `config`.
    pub fn new(config: RegistryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .build()
            .context("failed to build registry HTTP client")?;
        Ok(Self { client, config })
    }

    fn lookup_url(&self) -> String {
        format!(
            "{}/v1/networks/{}/subnets/{}/buckets/{}",
            self.config.url.trim_end_matches('/'),
            self.config.network,
            self.config.netuid,
            self.config.producer_uid,
        )
    }
}

#[async_trait]
impl BucketRegistry for RestBucketRegistry {
    async fn producer_bucket(&self) -> anyhow::Result<Option<Credentials>> {
        let url = self.lookup_url();
        tracing::debug!(%url, "looking up producer bucket");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("registry request to {url} failed"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let credentials = response
            .error_for_status()?
            .json()
            .await
            .context("registry returned a malformed bucket entry")?;
        Ok(Some(credentials))
    }
}

/// A [`CredentialLoader`] that reads a YAML credentials file.
#[derive(Debug, Clone)]
pub struct FileCredentialLoader {
    path: PathBuf,
}

impl FileCredentialLoader {
    /// Creates a loader for the file at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CredentialLoader for FileCredentialLoader {
    async fn load(&self) -> anyhow::Result<Credentials> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("unable to read credentials from {}", self.path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("invalid credentials file {}", self.path.display()))
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves [`Credentials`] through the registry, local and environment fallback chain.
#[derive(Clone)]
pub struct CredentialResolver {
    use_trusted_bucket: bool,
    registry: Option<Arc<dyn BucketRegistry>>,
    local: Option<Arc<dyn CredentialLoader>>,
    env_lookup: EnvLookup,
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("use_trusted_bucket", &self.use_trusted_bucket)
            .field("registry", &self.registry)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl CredentialResolver {
    /// Creates a resolver without registry or local source, reading the process environment.
    pub fn new(use_trusted_bucket: bool) -> Self {
        Self {
            use_trusted_bucket,
            registry: None,
            local: None,
            env_lookup: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Builds the resolver described by `config`.
    ///
    /// A registry client that cannot be constructed is logged and skipped.
    pub fn from_config(config: &MirrorConfig) -> Self {
        let mut resolver = Self::new(config.use_trusted_bucket);
        if let Some(registry_config) = &config.registry {
            match RestBucketRegistry::new(registry_config.clone()) {
                Ok(registry) => resolver = resolver.with_registry(Arc::new(registry)),
                Err(error) => tracing::warn!(?error, "unable to create registry client"),
            }
        }
        if let Some(path) = &config.credentials_path {
            resolver = resolver.with_local_loader(Arc::new(FileCredentialLoader::new(path.clone())));
        }
        resolver
    }

    /// Sets the trusted registry.
    pub fn with_registry(mut self, registry: Arc<dyn BucketRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the loader for static local credentials.
    pub fn with_local_loader(mut self, loader: Arc<dyn CredentialLoader>) -> Self {
        self.local = Some(loader);
        self
    }

    /// Replaces the environment used by the last fallback step.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env_lookup = Arc::new(lookup);
        self
    }

    /// Resolves the credentials. Never fails.
    pub async fn resolve(&self) -> Credentials {
        if self.use_trusted_bucket {
            if let Some(credentials) = self.resolve_from_registry().await {
                return credentials;
            }
        }

        match &self.local {
            Some(loader) => match loader.load().await {
                Ok(credentials) => {
                    tracing::info!(
                        bucket = %credentials.bucket_name,
                        "using local storage credentials"
                    );
                    return credentials;
                }
                Err(error) => tracing::warn!(?error, "failed to load local storage credentials"),
            },
            None => tracing::warn!("no local storage credentials configured"),
        }

        tracing::warn!("falling back to storage credentials from environment variables");
        Credentials::from_lookup(|key| (self.env_lookup)(key))
    }

    async fn resolve_from_registry(&self) -> Option<Credentials> {
        let Some(registry) = &self.registry else {
            tracing::warn!("no trusted registry configured; falling back to local credentials");
            return None;
        };
        match registry.producer_bucket().await {
            Ok(Some(credentials)) => {
                tracing::info!(
                    bucket = %credentials.bucket_name,
                    "using producer bucket from trusted registry"
                );
                Some(credentials)
            }
            Ok(None) => {
                tracing::warn!(
                    "producer bucket not found in trusted registry; falling back to local \
                    credentials"
                );
                None
            }
            Err(error) => {
                tracing::warn!(
                    ?error,
                    "trusted bucket resolution failed; falling back to local credentials"
                );
                None
            }
        }
    }
}
