use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use parcel_storage::BackendConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "parcel.toml";

/// Contents of `parcel.toml`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub storage: Option<BackendConfig>,
}

impl CliConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read `path`. A missing file is only tolerated when `required` is false.
    pub fn load(path: &Path, required: bool) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

/// Pick the backend: `--store` wins, then the `[storage]` table of the
/// configuration file.
pub fn resolve_backend(store: Option<&str>, config: Option<&Path>) -> anyhow::Result<BackendConfig> {
    if let Some(store) = store {
        return Ok(BackendConfig::from_connection_string(store)?);
    }
    let (path, required) = match config {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    match CliConfig::load(&path, required)?.storage {
        Some(storage) => Ok(storage),
        None => bail!(
            "no storage configured: pass --store or add a [storage] table to {}",
            path.display()
        ),
    }
}
