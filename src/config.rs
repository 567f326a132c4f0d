//! Applier configuration.

use std::{fs, path::Path};

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    rewrite::WINDOWS_FILES_PREFIX,
};

/// The platform whose layers the host applies natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostPlatform {
    Linux,
    Windows,
}

impl HostPlatform {
    /// The platform this binary was built for.
    pub const fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Linux
        }
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::current()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Entries outside this prefix are dropped from Windows layers; the prefix
    /// is stripped from the rest.
    pub path_prefix: String,
    pub host: HostPlatform,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path_prefix: WINDOWS_FILES_PREFIX.into(),
            host: HostPlatform::current(),
        }
    }
}

impl Config {
    pub fn from_toml(data: &str) -> Result<Self> {
        let config: Config = toml::from_str(data).map_err(|e| Error::Config(e.to_string()))?;
        if config.path_prefix.is_empty() {
            return Err(Error::Config("path_prefix must not be empty".into()));
        }
        Ok(config)
    }

    /// Reads the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&data)
    }
}
