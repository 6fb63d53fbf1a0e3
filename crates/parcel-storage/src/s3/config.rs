use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::sign::Credentials;
use crate::types::{DEFAULT_CHUNK_SIZE, MAX_MULTIPART_CHUNK_SIZE, MIN_MULTIPART_CHUNK_SIZE};

/// Environment flag that turns off TLS certificate verification.
pub const INSECURE_SKIP_VERIFY_ENV: &str = "AWS_INSECURE_SKIP_VERIFY";

/// Settings for an S3-compatible object store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    /// Prepended to every object key; listings strip it again.
    pub prefix: String,
    pub region: String,
    /// Custom endpoint such as `http://localhost:9000`. Setting one implies
    /// path-style addressing.
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    /// Value for `x-amz-server-side-encryption`, e.g. `AES256` or `aws:kms`.
    pub sse: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Part size for chunked uploads, in bytes.
    pub part_size: u64,
    /// Parts uploaded in parallel by a single write.
    pub upload_concurrency: usize,
    /// Page size for listings.
    pub max_keys: u32,
    /// Accept any TLS certificate. Local test endpoints only.
    pub insecure_skip_verify: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            region: "us-east-1".into(),
            endpoint: None,
            force_path_style: false,
            sse: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            part_size: DEFAULT_CHUNK_SIZE,
            upload_concurrency: 4,
            max_keys: 1000,
            insecure_skip_verify: false,
        }
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("force_path_style", &self.force_path_style)
            .field("sse", &self.sse)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redacted(&self.secret_access_key))
            .field("session_token", &redacted(&self.session_token))
            .field("part_size", &self.part_size)
            .field("upload_concurrency", &self.upload_concurrency)
            .field("max_keys", &self.max_keys)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

impl S3Config {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Effective part size, clamped to the provider's part limits.
    pub fn part_size(&self) -> usize {
        let size = self
            .part_size
            .clamp(MIN_MULTIPART_CHUNK_SIZE, MAX_MULTIPART_CHUNK_SIZE);
        usize::try_from(size).unwrap_or(usize::MAX)
    }

    /// Whether requests use `endpoint/bucket/key` rather than `bucket.endpoint/key`.
    pub fn path_style(&self) -> bool {
        self.force_path_style || self.endpoint.is_some()
    }

    /// Apply the environment: the TLS override flag, and credentials when none
    /// are configured.
    pub fn with_env(mut self) -> Self {
        if env::var(INSECURE_SKIP_VERIFY_ENV).is_ok_and(|v| v == "true") {
            self.insecure_skip_verify = true;
        }
        if self.access_key_id.is_none() && self.secret_access_key.is_none() {
            self.access_key_id = env::var("AWS_ACCESS_KEY_ID").ok();
            self.secret_access_key = env::var("AWS_SECRET_ACCESS_KEY").ok();
            if self.session_token.is_none() {
                self.session_token = env::var("AWS_SESSION_TOKEN").ok();
            }
        }
        self
    }

    /// Signing credentials, or `None` to send anonymous requests.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) if !id.is_empty() => Some(Credentials {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
                session_token: self.session_token.clone().filter(|t| !t.is_empty()),
            }),
            _ => None,
        }
    }
}
