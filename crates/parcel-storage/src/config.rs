//! Backend selection.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{StorageError, StorageResult};
use crate::fs::FilesystemBackend;
use crate::s3::{ObjectStoreBackend, S3Config};
use crate::traits::StorageBackend;

/// Which backend to open, and how.
///
/// In TOML:
/// ```toml
/// [storage]
/// type = "filesystem"
/// root = "/var/lib/parcel"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Filesystem { root: PathBuf },
    S3(S3Config),
}

impl BackendConfig {
    /// Parse a connection string.
    ///
    /// Accepted forms:
    /// - `fs:///abs/root` or `file:///abs/root`
    /// - `s3://bucket/optional/prefix?region=..&endpoint=..&sse=..&force_path_style=true`
    ///
    /// Object-store settings not given in the string keep their defaults and
    /// are then completed from the environment.
    pub fn from_connection_string(value: &str) -> StorageResult<Self> {
        let value = value.trim();
        if let Some(root) = value
            .strip_prefix("fs://")
            .or_else(|| value.strip_prefix("file://"))
        {
            if root.is_empty() {
                return Err(StorageError::Config(format!("{value:?} names no directory")));
            }
            return Ok(Self::Filesystem { root: PathBuf::from(root) });
        }

        let url = Url::parse(value)
            .map_err(|e| StorageError::Config(format!("invalid connection string {value:?}: {e}")))?;
        if url.scheme() != "s3" {
            return Err(StorageError::Config(format!(
                "unsupported storage scheme {:?}; expected fs, file or s3",
                url.scheme()
            )));
        }
        let bucket = url
            .host_str()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| StorageError::Config(format!("{value:?} names no bucket")))?;

        let mut config = S3Config::new(bucket);
        config.prefix = url.path().trim_matches('/').to_string();
        for (name, setting) in url.query_pairs() {
            match name.as_ref() {
                "region" => config.region = setting.into_owned(),
                "endpoint" => config.endpoint = Some(setting.into_owned()),
                "sse" => config.sse = Some(setting.into_owned()),
                "force_path_style" => config.force_path_style = parse_setting(&name, &setting)?,
                "part_size" => config.part_size = parse_setting(&name, &setting)?,
                "upload_concurrency" => config.upload_concurrency = parse_setting(&name, &setting)?,
                "max_keys" => config.max_keys = parse_setting(&name, &setting)?,
                other => {
                    return Err(StorageError::Config(format!("unknown s3 setting {other:?}")));
                }
            }
        }
        Ok(Self::S3(config.with_env()))
    }

    /// Construct the configured backend.
    pub fn open(&self) -> StorageResult<Arc<dyn StorageBackend>> {
        match self {
            Self::Filesystem { root } => Ok(Arc::new(FilesystemBackend::new(root.clone()))),
            Self::S3(config) => Ok(Arc::new(ObjectStoreBackend::new(config.clone().with_env())?)),
        }
    }
}

fn parse_setting<T: std::str::FromStr>(name: &str, value: &str) -> StorageResult<T> {
    value
        .parse()
        .map_err(|_| StorageError::Config(format!("invalid value {value:?} for s3 setting {name:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_connection_strings() {
        assert_eq!(
            BackendConfig::from_connection_string("fs:///var/lib/parcel").unwrap(),
            BackendConfig::Filesystem {
                root: PathBuf::from("/var/lib/parcel")
            }
        );
        assert_eq!(
            BackendConfig::from_connection_string("file:///tmp/store").unwrap(),
            BackendConfig::Filesystem {
                root: PathBuf::from("/tmp/store")
            }
        );
        assert!(BackendConfig::from_connection_string("fs://").is_err());
    }

    #[test]
    fn s3_connection_string() {
        let config = BackendConfig::from_connection_string(
            "s3://artifacts/team/a/?region=eu-west-1&endpoint=http://localhost:9000&sse=AES256&max_keys=50",
        )
        .unwrap();
        let BackendConfig::S3(s3) = config else {
            panic!("expected s3 config");
        };
        assert_eq!(s3.bucket, "artifacts");
        assert_eq!(s3.prefix, "team/a");
        assert_eq!(s3.region, "eu-west-1");
        assert_eq!(s3.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(s3.sse.as_deref(), Some("AES256"));
        assert_eq!(s3.max_keys, 50);
        assert!(s3.path_style());
    }

    #[test]
    fn rejects_bad_connection_strings() {
        for bad in [
            "ftp://host/x",
            "s3:///no-bucket",
            "s3://b?colour=blue",
            "s3://b?force_path_style=maybe",
            "not a url",
        ] {
            assert!(
                matches!(BackendConfig::from_connection_string(bad), Err(StorageError::Config(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn toml_round_trip() {
        let parsed: BackendConfig = toml::from_str(
            r#"
            type = "s3"
            bucket = "artifacts"
            region = "us-west-2"
            "#,
        )
        .unwrap();
        let BackendConfig::S3(s3) = &parsed else {
            panic!("expected s3 config");
        };
        assert_eq!(s3.region, "us-west-2");
        assert_eq!(s3.part_size(), 10 * 1024 * 1024);

        let fs: BackendConfig = toml::from_str("type = \"filesystem\"\nroot = \"/srv\"").unwrap();
        assert_eq!(fs, BackendConfig::Filesystem { root: "/srv".into() });
    }

    #[test]
    fn open_builds_the_named_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = BackendConfig::Filesystem {
            root: dir.path().to_path_buf(),
        }
        .open()
        .unwrap();
        assert_eq!(backend.name(), "filesystem");

        let backend = BackendConfig::S3(S3Config::new("artifacts")).open().unwrap();
        assert_eq!(backend.name(), "s3");
    }
}
