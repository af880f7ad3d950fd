// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Loading of YAML configuration files and `~` expansion for configured paths.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de::DeserializeOwned, de::Error};

/// Trait for configuration types that can be read from a YAML file.
pub trait LoadConfig: DeserializeOwned {
    /// Loads the configuration from the YAML file at `path`.
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "reading config from file");

        let reader = std::fs::File::open(path)
            .with_context(|| format!("unable to load config from {}", path.display()))?;

        serde_yaml::from_reader(reader)
            .with_context(|| format!("invalid config file {}", path.display()))
    }
}

/// Deserializes a path, resolving a leading `~/` to the user's home directory.
pub fn resolve_home_dir<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let path: PathBuf = Deserialize::deserialize(deserializer)?;
    expand_home_dir(path).map_err(D::Error::custom)
}

/// Deserializes an optional path, resolving a leading `~/` to the user's home directory.
pub fn resolve_home_dir_option<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let path: Option<PathBuf> = Deserialize::deserialize(deserializer)?;
    let Some(path) = path else { return Ok(None) };
    Ok(Some(expand_home_dir(path).map_err(D::Error::custom)?))
}

/// Replaces a leading `~/` in `path` with the user's home directory.
///
/// Paths without that prefix are returned unchanged.
pub fn expand_home_dir(path: impl Into<PathBuf>) -> Result<PathBuf> {
    let path = path.into();
    // `~user/...` is not a `~` component and is left alone.
    let Ok(relative) = path.strip_prefix("~") else {
        return Ok(path);
    };
    let home = home::home_dir().context("unable to resolve home directory")?;
    Ok(home.join(relative))
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        #[serde(deserialize_with = "resolve_home_dir")]
        root: PathBuf,
        #[serde(default, deserialize_with = "resolve_home_dir_option")]
        extra: Option<PathBuf>,
    }

    impl LoadConfig for Sample {}

    #[test]
    fn absolute_paths_are_unchanged() -> Result<()> {
        assert_eq!(expand_home_dir("/var/cache")?, PathBuf::from("/var/cache"));
        assert_eq!(expand_home_dir("relative/dir")?, PathBuf::from("relative/dir"));
        assert_eq!(expand_home_dir("~other/dir")?, PathBuf::from("~other/dir"));
        Ok(())
    }

    #[test]
    fn tilde_is_expanded() -> Result<()> {
        let Some(home) = home::home_dir() else {
            return Ok(());
        };
        assert_eq!(expand_home_dir("~/cache")?, home.join("cache"));
        Ok(())
    }

    #[test]
    fn loads_yaml_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "root: /tmp/mirror\nextra: /tmp/extra")?;

        let sample = Sample::load(file.path())?;

        assert_eq!(
            sample,
            Sample {
                root: PathBuf::from("/tmp/mirror"),
                extra: Some(PathBuf::from("/tmp/extra")),
            }
        );
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        let error = Sample::load("/definitely/not/here.yaml").unwrap_err();
        assert!(error.to_string().contains("unable to load config"));
    }
}
