//! S3-compatible object-store backend.
//!
//! Requests are signed with SigV4 and sent with `reqwest`. There is no
//! client-side locking: concurrent writers to one key get the provider's
//! last-write-wins behavior.
//!
//! `write` is the common path. Payloads smaller than one part go up in a
//! single PUT; larger ones are split into parts that are uploaded in parallel
//! and assembled, and the upload is aborted if any step fails. The explicit
//! multipart operations expose the same protocol to callers that manage parts
//! themselves.

mod config;
mod sign;
mod xml;

#[cfg(test)]
mod fake;

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parcel_types::{storage_key, storage_prefix};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use reqwest::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub use config::{S3Config, INSECURE_SKIP_VERIFY_ENV};
pub use sign::Credentials;

use crate::cancel::with_cancel;
use crate::error::{StorageError, StorageResult};
use crate::traits::StorageBackend;
use crate::types::{validate_part_order, CompletedPart, StorageObject, MAX_PART_NUMBER};

const BACKEND: &str = "s3";

/// Largest buffer reserved up front for a caller-supplied part.
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

/// One page of a listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<StorageObject>,
    /// Pass to the next [`ObjectStoreBackend::list_page`] call; `None` on the last page.
    pub next_continuation_token: Option<String>,
}

/// Stores objects in one bucket of an S3-compatible service.
#[derive(Debug)]
pub struct ObjectStoreBackend {
    http: reqwest::Client,
    config: S3Config,
    credentials: Option<Credentials>,
    endpoint: Url,
    /// Normalized key prefix without slashes at either end; empty for none.
    prefix: String,
}

impl ObjectStoreBackend {
    pub fn new(config: S3Config) -> StorageResult<Self> {
        if config.bucket.trim().is_empty() {
            return Err(StorageError::Config("s3 bucket is required".into()));
        }
        let raw_endpoint = match &config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://s3.{}.amazonaws.com", config.region),
        };
        let endpoint = Url::parse(&raw_endpoint)
            .map_err(|e| StorageError::Config(format!("invalid endpoint {raw_endpoint:?}: {e}")))?;
        if endpoint.host_str().is_none() {
            return Err(StorageError::Config(format!("endpoint {raw_endpoint:?} has no host")));
        }

        if config.insecure_skip_verify {
            warn!(endpoint = %endpoint, "TLS certificate verification is disabled");
        }
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .build()
            .map_err(|e| StorageError::Config(format!("building HTTP client: {e}")))?;

        let credentials = config.credentials();
        if credentials.is_none() {
            debug!(bucket = %config.bucket, "no credentials configured, sending unsigned requests");
        }
        let prefix = storage_prefix(&config.prefix).trim_end_matches('/').to_string();

        Ok(Self {
            http,
            credentials,
            endpoint,
            prefix,
            config,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix)
        }
    }

    /// Backend-relative path for a full object key, or `None` if the key lies
    /// outside the prefix.
    fn relative_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            return Some(key);
        }
        key.strip_prefix(self.prefix.as_str())?.strip_prefix('/')
    }

    fn url(&self, bucket: &str, key: Option<&str>, query: &str) -> StorageResult<Url> {
        let encoded = key.map(sign::encode_key).unwrap_or_default();
        let mut raw = if self.config.path_style() {
            let base = self.endpoint.as_str().trim_end_matches('/');
            match key {
                Some(_) => format!("{base}/{bucket}/{encoded}"),
                None => format!("{base}/{bucket}"),
            }
        } else {
            format!(
                "{}://{bucket}.{}/{encoded}",
                self.endpoint.scheme(),
                host_header(&self.endpoint)
            )
        };
        if !query.is_empty() {
            raw.push('?');
            raw.push_str(query);
        }
        Url::parse(&raw).map_err(|e| StorageError::Config(format!("invalid request URL {raw:?}: {e}")))
    }

    fn sse_headers(&self) -> Vec<(&'static str, String)> {
        match &self.config.sse {
            Some(sse) => vec![("x-amz-server-side-encryption", sse.clone())],
            None => Vec::new(),
        }
    }

    /// Build and sign a request. `key` is a full object key; `None` addresses
    /// the bucket itself.
    fn request(
        &self,
        method: Method,
        bucket: &str,
        key: Option<&str>,
        query: &[(&str, String)],
        extra_headers: Vec<(&'static str, String)>,
        body: Bytes,
    ) -> StorageResult<reqwest::Request> {
        let url = self.url(bucket, key, &sign::canonical_query(query))?;
        let now = Utc::now();
        let payload_hash = sign::sha256_hex(&body);

        let mut headers: Vec<(String, String)> = extra_headers
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        headers.push(("x-amz-date".into(), sign::amz_date(now)));
        headers.push(("x-amz-content-sha256".into(), payload_hash.clone()));
        if let Some(token) = self.credentials.as_ref().and_then(|c| c.session_token.clone()) {
            headers.push(("x-amz-security-token".into(), token));
        }

        let mut builder = self.http.request(method.clone(), url.clone());
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(credentials) = &self.credentials {
            headers.push(("host".into(), host_header(&url)));
            let auth = sign::authorization(
                credentials,
                &self.config.region,
                now,
                method.as_str(),
                &url,
                &headers,
                &payload_hash,
            )?;
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder
            .body(body)
            .build()
            .map_err(|e| StorageError::Config(format!("building {method} request: {e}")))
    }

    /// List one page of objects under `prefix`, starting from `continuation`.
    pub async fn list_page(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
        continuation: Option<&str>,
    ) -> StorageResult<ListPage> {
        let relative = storage_prefix(prefix);
        let full_prefix = if self.prefix.is_empty() {
            relative.clone()
        } else {
            format!("{}/{relative}", self.prefix)
        };
        let mut query = vec![
            ("list-type", "2".to_string()),
            ("prefix", full_prefix),
            ("max-keys", self.config.max_keys.to_string()),
        ];
        if let Some(token) = continuation {
            query.push(("continuation-token", token.to_string()));
        }

        with_cancel(cancel, async {
            let request = self.request(Method::GET, self.bucket(), None, &query, Vec::new(), Bytes::new())?;
            let body = response_text("list", &relative, execute(&self.http, "list", &relative, request).await?).await?;
            let parsed: xml::ListBucketResult =
                quick_xml::de::from_str(&body).map_err(|e| malformed("list", &relative, e))?;

            let mut objects = Vec::with_capacity(parsed.contents.len());
            for entry in parsed.contents {
                let Some(path) = self.relative_key(&entry.key) else {
                    continue;
                };
                // Folder placeholder objects are not artifacts.
                if path.is_empty() || path.ends_with('/') {
                    continue;
                }
                objects.push(StorageObject {
                    path: path.to_string(),
                    last_modified: parse_timestamp(&entry.last_modified),
                    size: entry.size,
                });
            }
            let next_continuation_token = parsed
                .next_continuation_token
                .filter(|_| parsed.is_truncated);
            debug!(
                backend = BACKEND,
                prefix = %relative,
                count = objects.len(),
                truncated = next_continuation_token.is_some(),
                "listed objects"
            );
            Ok(ListPage {
                objects,
                next_continuation_token,
            })
        })
        .await
    }

    async fn put_object(&self, path: &str, key: &str, body: Bytes) -> StorageResult<()> {
        let request = self.request(Method::PUT, self.bucket(), Some(key), &[], self.sse_headers(), body)?;
        execute(&self.http, "write", path, request).await?;
        Ok(())
    }

    /// Server-side copy of `src_key` in this bucket to `dst_key` in `dst_bucket`.
    async fn copy_object(
        &self,
        operation: &'static str,
        path: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> StorageResult<()> {
        let mut headers = vec![(
            "x-amz-copy-source",
            format!("/{}/{}", self.bucket(), sign::encode_key(src_key)),
        )];
        headers.extend(self.sse_headers());
        let request = self.request(Method::PUT, dst_bucket, Some(dst_key), &[], headers, Bytes::new())?;
        let body = response_text(operation, path, execute(&self.http, operation, path, request).await?).await?;
        // A copy can fail after the provider has already sent 200 OK.
        match embedded_error(operation, path, &body) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete_object(&self, operation: &'static str, path: &str, key: &str) -> StorageResult<()> {
        let request = self.request(Method::DELETE, self.bucket(), Some(key), &[], Vec::new(), Bytes::new())?;
        execute(&self.http, operation, path, request).await?;
        Ok(())
    }

    async fn head_object(&self, operation: &'static str, path: &str, key: &str) -> StorageResult<StorageObject> {
        let request = self.request(Method::HEAD, self.bucket(), Some(key), &[], Vec::new(), Bytes::new())?;
        let response = execute(&self.http, operation, path, request).await?;
        let headers = response.headers();
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(parse_timestamp)
            .unwrap_or_default();
        Ok(StorageObject {
            path: path.to_string(),
            last_modified,
            size,
        })
    }

    async fn create_multipart(&self, operation: &'static str, path: &str, key: &str) -> StorageResult<String> {
        let request = self.request(
            Method::POST,
            self.bucket(),
            Some(key),
            &[("uploads", String::new())],
            self.sse_headers(),
            Bytes::new(),
        )?;
        let body = response_text(operation, path, execute(&self.http, operation, path, request).await?).await?;
        let parsed: xml::InitiateMultipartUploadResult =
            quick_xml::de::from_str(&body).map_err(|e| malformed(operation, path, e))?;
        if parsed.upload_id.is_empty() {
            return Err(malformed(operation, path, "response carried no upload id"));
        }
        Ok(parsed.upload_id)
    }

    fn part_request(&self, key: &str, upload_id: &str, part_number: u32, body: Bytes) -> StorageResult<reqwest::Request> {
        self.request(
            Method::PUT,
            self.bucket(),
            Some(key),
            &[
                ("partNumber", part_number.to_string()),
                ("uploadId", upload_id.to_string()),
            ],
            Vec::new(),
            body,
        )
    }

    async fn complete_upload(
        &self,
        operation: &'static str,
        path: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let document = quick_xml::se::to_string(&xml::CompleteMultipartUpload::from_parts(parts))
            .map_err(|e| StorageError::Config(format!("encoding completion request: {e}")))?;
        let request = self.request(
            Method::POST,
            self.bucket(),
            Some(key),
            &[("uploadId", upload_id.to_string())],
            vec![("content-type", "application/xml".to_string())],
            Bytes::from(document),
        )?;
        let body = response_text(operation, path, execute(&self.http, operation, path, request).await?).await?;
        match embedded_error(operation, path, &body) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn abort_request(&self, key: &str, upload_id: &str) -> StorageResult<reqwest::Request> {
        self.request(
            Method::DELETE,
            self.bucket(),
            Some(key),
            &[("uploadId", upload_id.to_string())],
            Vec::new(),
            Bytes::new(),
        )
    }

    /// Split the rest of `reader` into parts and upload them, at most
    /// `upload_concurrency` at a time. `first` is the already-read first part.
    async fn upload_parts(
        &self,
        path: &str,
        key: &str,
        upload_id: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        first: Bytes,
    ) -> StorageResult<(Vec<CompletedPart>, u64)> {
        let part_size = self.config.part_size();
        let concurrency = self.config.upload_concurrency.max(1);
        // Dropping the set on an early return aborts the remaining part tasks.
        let mut tasks = JoinSet::new();
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut part_number = 0u32;
        let mut chunk = first;

        loop {
            part_number += 1;
            if part_number > MAX_PART_NUMBER {
                return Err(StorageError::InvalidPartNumber(part_number));
            }
            let size = chunk.len() as u64;
            total += size;
            let request = self.part_request(key, upload_id, part_number, chunk)?;
            tasks.spawn(send_part(self.http.clone(), path.to_string(), part_number, size, request));

            while tasks.len() >= concurrency {
                match tasks.join_next().await {
                    Some(joined) => parts.push(joined_part(path, joined)?),
                    None => break,
                }
            }

            chunk = read_chunk(reader, part_size)
                .await
                .map_err(|e| StorageError::io("write", path, e))?;
            if chunk.is_empty() {
                break;
            }
        }
        while let Some(joined) = tasks.join_next().await {
            parts.push(joined_part(path, joined)?);
        }

        parts.sort_by_key(|part| part.part_number);
        Ok((parts, total))
    }

    /// Multipart path of `write`: initiate, upload parts, complete; abort on
    /// any failure.
    async fn write_chunked(
        &self,
        cancel: &CancellationToken,
        path: &str,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        first: Bytes,
    ) -> StorageResult<u64> {
        let upload_id = with_cancel(cancel, self.create_multipart("write", path, key)).await?;
        debug!(backend = BACKEND, path, upload_id = %upload_id, "started chunked upload");

        let outcome = with_cancel(cancel, async {
            let (parts, total) = self.upload_parts(path, key, &upload_id, reader, first).await?;
            self.complete_upload("write", path, key, &upload_id, &parts).await?;
            debug!(backend = BACKEND, path, parts = parts.len(), bytes = total, "completed chunked upload");
            Ok(total)
        })
        .await;

        if let Err(err) = &outcome {
            let detach = matches!(err, StorageError::Cancelled);
            self.abort_after_failure(path, key, &upload_id, detach).await;
        }
        outcome
    }

    /// Best-effort cleanup of a broken chunked upload. After cancellation the
    /// abort runs in the background so the caller is not kept waiting.
    async fn abort_after_failure(&self, path: &str, key: &str, upload_id: &str, detach: bool) {
        let request = match self.abort_request(key, upload_id) {
            Ok(request) => request,
            Err(error) => {
                warn!(backend = BACKEND, path, upload_id, error = %error, "could not build abort request");
                return;
            }
        };
        let http = self.http.clone();
        let path = path.to_string();
        let upload_id = upload_id.to_string();
        let abort = async move {
            match execute(&http, "abort_multipart", &path, request).await {
                Ok(_) => debug!(backend = BACKEND, path = %path, upload_id = %upload_id, "aborted chunked upload"),
                Err(error) => warn!(
                    backend = BACKEND,
                    path = %path,
                    upload_id = %upload_id,
                    error = %error,
                    "failed to abort chunked upload"
                ),
            }
        };
        if detach {
            tokio::spawn(abort);
        } else {
            abort.await;
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    /// A single page of at most `max_keys` objects; use
    /// [`ObjectStoreBackend::list_page`] to go further.
    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> StorageResult<Vec<StorageObject>> {
        Ok(self.list_page(cancel, prefix, None).await?.objects)
    }

    async fn read(
        &self,
        cancel: &CancellationToken,
        path: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> StorageResult<u64> {
        let path = storage_key(path)?;
        let key = self.object_key(&path);
        with_cancel(cancel, async {
            let request = self.request(Method::GET, self.bucket(), Some(&key), &[], Vec::new(), Bytes::new())?;
            let mut response = execute(&self.http, "read", &path, request).await?;
            let mut copied = 0u64;
            while let Some(chunk) = response.chunk().await.map_err(|source| StorageError::Transport {
                operation: "read",
                path: path.clone(),
                source,
            })? {
                writer
                    .write_all(&chunk)
                    .await
                    .map_err(|e| StorageError::io("read", &path, e))?;
                copied += chunk.len() as u64;
            }
            writer.flush().await.map_err(|e| StorageError::io("read", &path, e))?;
            debug!(backend = BACKEND, path = %path, bytes = copied, "read object");
            Ok(copied)
        })
        .await
    }

    async fn stat(&self, cancel: &CancellationToken, path: &str) -> StorageResult<StorageObject> {
        let path = storage_key(path)?;
        let key = self.object_key(&path);
        with_cancel(cancel, self.head_object("stat", &path, &key)).await
    }

    async fn write(
        &self,
        cancel: &CancellationToken,
        path: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
    ) -> StorageResult<u64> {
        let path = storage_key(path)?;
        let key = self.object_key(&path);
        let part_size = self.config.part_size();

        let first = with_cancel(cancel, async {
            read_chunk(reader, part_size)
                .await
                .map_err(|e| StorageError::io("write", &path, e))
        })
        .await?;

        let written = if first.len() < part_size {
            let written = first.len() as u64;
            with_cancel(cancel, self.put_object(&path, &key, first)).await?;
            written
        } else {
            self.write_chunked(cancel, &path, &key, reader, first).await?
        };
        if written != size {
            debug!(backend = BACKEND, path = %path, declared = size, written, "size hint differed from bytes written");
        }
        debug!(backend = BACKEND, path = %path, bytes = written, "wrote object");
        Ok(written)
    }

    /// Fails with `NotFound` for a missing object, even though the provider's
    /// own delete would succeed silently.
    async fn delete(&self, cancel: &CancellationToken, path: &str) -> StorageResult<()> {
        let path = storage_key(path)?;
        let key = self.object_key(&path);
        with_cancel(cancel, async {
            self.head_object("delete", &path, &key).await?;
            self.delete_object("delete", &path, &key).await?;
            debug!(backend = BACKEND, path = %path, "deleted object");
            Ok(())
        })
        .await
    }

    async fn move_object(&self, cancel: &CancellationToken, from: &str, to: &str) -> StorageResult<()> {
        let src = storage_key(from)?;
        let dst = storage_key(to)?;
        let src_key = self.object_key(&src);
        let dst_key = self.object_key(&dst);
        with_cancel(cancel, async {
            if src_key == dst_key {
                self.head_object("move", &src, &src_key).await?;
                return Ok(());
            }
            self.copy_object("move", &src, &src_key, self.bucket(), &dst_key).await?;
            self.delete_object("move", &src, &src_key).await?;
            debug!(backend = BACKEND, from = %src, to = %dst, "moved object");
            Ok(())
        })
        .await
    }

    async fn move_to_bucket(
        &self,
        cancel: &CancellationToken,
        from: &str,
        to: &str,
        bucket: &str,
    ) -> StorageResult<()> {
        if bucket.trim().is_empty() {
            return Err(StorageError::Config("destination bucket is empty".into()));
        }
        let src = storage_key(from)?;
        let dst = storage_key(to)?;
        let src_key = self.object_key(&src);
        let dst_key = self.object_key(&dst);
        with_cancel(cancel, async {
            self.copy_object("move_to_bucket", &src, &src_key, bucket, &dst_key).await?;
            self.delete_object("move_to_bucket", &src, &src_key).await?;
            debug!(backend = BACKEND, from = %src, to = %dst, bucket, "moved object to bucket");
            Ok(())
        })
        .await
    }

    async fn initiate_multipart(&self, cancel: &CancellationToken, path: &str) -> StorageResult<String> {
        let path = storage_key(path)?;
        let key = self.object_key(&path);
        let upload_id = with_cancel(cancel, self.create_multipart("initiate_multipart", &path, &key)).await?;
        debug!(backend = BACKEND, path = %path, upload_id = %upload_id, "initiated multipart upload");
        Ok(upload_id)
    }

    async fn write_multipart(
        &self,
        cancel: &CancellationToken,
        path: &str,
        upload_id: &str,
        part_number: u32,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
    ) -> StorageResult<CompletedPart> {
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(StorageError::InvalidPartNumber(part_number));
        }
        let path = storage_key(path)?;
        let key = self.object_key(&path);
        with_cancel(cancel, async {
            let mut body = Vec::with_capacity(size.min(MAX_PREALLOC) as usize);
            (&mut *reader)
                .take(size)
                .read_to_end(&mut body)
                .await
                .map_err(|e| StorageError::io("write_multipart", &path, e))?;
            if body.len() as u64 != size {
                return Err(StorageError::Io {
                    operation: "write_multipart",
                    path: path.clone(),
                    source: io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("part {part_number} declared {size} bytes, reader produced {}", body.len()),
                    ),
                });
            }
            let request = self.part_request(&key, upload_id, part_number, Bytes::from(body))?;
            let part = send_part(self.http.clone(), path.clone(), part_number, size, request).await?;
            debug!(backend = BACKEND, path = %path, upload_id, part_number, bytes = size, "uploaded part");
            Ok(part)
        })
        .await
    }

    async fn complete_multipart(
        &self,
        cancel: &CancellationToken,
        path: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        validate_part_order(parts)?;
        let path = storage_key(path)?;
        let key = self.object_key(&path);
        with_cancel(cancel, self.complete_upload("complete_multipart", &path, &key, upload_id, parts)).await?;
        debug!(backend = BACKEND, path = %path, upload_id, parts = parts.len(), "completed multipart upload");
        Ok(())
    }

    /// Succeeds when the provider no longer knows the upload, whether it was
    /// already aborted, completed, or expired.
    async fn abort_multipart(&self, cancel: &CancellationToken, path: &str, upload_id: &str) -> StorageResult<()> {
        let path = storage_key(path)?;
        let key = self.object_key(&path);
        let result = with_cancel(cancel, async {
            let request = self.abort_request(&key, upload_id)?;
            execute(&self.http, "abort_multipart", &path, request).await
        })
        .await;
        match result {
            Ok(_) => {
                debug!(backend = BACKEND, path = %path, upload_id, "aborted multipart upload");
                Ok(())
            }
            Err(err) if err.provider_code() == Some("NoSuchUpload") => {
                debug!(backend = BACKEND, path = %path, upload_id, "upload already gone, abort is a no-op");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// `host[:port]` as sent in the `Host` header; default ports are omitted.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Send a request and turn non-2xx responses into typed errors.
async fn execute(
    http: &reqwest::Client,
    operation: &'static str,
    path: &str,
    request: reqwest::Request,
) -> StorageResult<reqwest::Response> {
    let response = http
        .execute(request)
        .await
        .map_err(|source| StorageError::Transport {
            operation,
            path: path.to_string(),
            source,
        })?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(provider_error(operation, path, status, &body))
}

async fn response_text(operation: &'static str, path: &str, response: reqwest::Response) -> StorageResult<String> {
    response.text().await.map_err(|source| StorageError::Transport {
        operation,
        path: path.to_string(),
        source,
    })
}

fn provider_error(operation: &'static str, path: &str, status: StatusCode, body: &str) -> StorageError {
    let parsed: xml::ErrorResponse = quick_xml::de::from_str(body).unwrap_or_default();
    // HEAD responses carry no body, so a bare 404 is all there is to go on.
    if parsed.code == "NoSuchKey" || (status == StatusCode::NOT_FOUND && parsed.code.is_empty()) {
        return StorageError::NotFound { path: path.to_string() };
    }
    let code = if parsed.code.is_empty() {
        status.canonical_reason().unwrap_or("Unknown").replace(' ', "")
    } else {
        parsed.code
    };
    StorageError::Provider {
        operation,
        path: path.to_string(),
        status: status.as_u16(),
        code,
        message: parsed.message,
    }
}

fn embedded_error(operation: &'static str, path: &str, body: &str) -> Option<StorageError> {
    if body.contains("<Error>") {
        Some(provider_error(operation, path, StatusCode::OK, body))
    } else {
        None
    }
}

fn malformed(operation: &'static str, path: &str, detail: impl std::fmt::Display) -> StorageError {
    StorageError::Provider {
        operation,
        path: path.to_string(),
        status: StatusCode::OK.as_u16(),
        code: "MalformedResponse".into(),
        message: detail.to_string(),
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Read up to `limit` bytes; a short result means the reader is exhausted.
async fn read_chunk(reader: &mut (dyn AsyncRead + Unpin + Send), limit: usize) -> io::Result<Bytes> {
    let mut buf = Vec::with_capacity(limit.min(MAX_PREALLOC as usize));
    (&mut *reader).take(limit as u64).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn send_part(
    http: reqwest::Client,
    path: String,
    part_number: u32,
    size: u64,
    request: reqwest::Request,
) -> StorageResult<CompletedPart> {
    let response = execute(&http, "write_multipart", &path, request).await?;
    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| malformed("write_multipart", &path, format!("part {part_number} response has no ETag")))?;
    Ok(CompletedPart {
        part_number,
        etag,
        size,
    })
}

fn joined_part(
    path: &str,
    joined: Result<StorageResult<CompletedPart>, JoinError>,
) -> StorageResult<CompletedPart> {
    joined.map_err(|e| StorageError::io("write", path, io::Error::other(e)))?
}
