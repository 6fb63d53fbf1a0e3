//! In-process S3-compatible server for tests.
//!
//! Path-style addressing only. Implements the subset the backend speaks:
//! put/get/head/delete, ListObjectsV2, server-side copy and the multipart
//! endpoints. Failure switches let tests break a part upload or a completion.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};

use super::xml;
use super::S3Config;

#[derive(Clone, Debug)]
pub struct FakeObject {
    pub data: Vec<u8>,
    pub last_modified: DateTime<Utc>,
    pub sse: Option<String>,
}

struct Upload {
    bucket: String,
    key: String,
    sse: Option<String>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, BTreeMap<String, FakeObject>>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
    authorizations: Vec<String>,
    fail_part: Option<u32>,
    fail_completion: bool,
}

type Shared = Arc<Mutex<Inner>>;

pub struct FakeS3 {
    addr: SocketAddr,
    inner: Shared,
}

impl FakeS3 {
    pub async fn start(buckets: &[&str]) -> Self {
        let inner = Shared::default();
        {
            let mut guard = inner.lock().unwrap();
            for bucket in buckets {
                guard.buckets.insert(bucket.to_string(), BTreeMap::new());
            }
        }
        let app = Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&inner))
            .layer(DefaultBodyLimit::disable());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, inner }
    }

    /// Backend settings pointing at this server, with dummy credentials.
    pub fn config(&self, bucket: &str) -> S3Config {
        S3Config {
            endpoint: Some(format!("http://{}", self.addr)),
            access_key_id: Some("test-key".into()),
            secret_access_key: Some("test-secret".into()),
            ..S3Config::new(bucket)
        }
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<FakeObject> {
        self.inner.lock().unwrap().buckets.get(bucket)?.get(key).cloned()
    }

    pub fn insert(&self, bucket: &str, key: &str, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.buckets.get_mut(bucket).unwrap().insert(
            key.to_string(),
            FakeObject {
                data: data.to_vec(),
                last_modified: Utc::now(),
                sse: None,
            },
        );
    }

    pub fn pending_uploads(&self) -> usize {
        self.inner.lock().unwrap().uploads.len()
    }

    pub fn authorizations(&self) -> Vec<String> {
        self.inner.lock().unwrap().authorizations.clone()
    }

    /// Make every upload of this part number fail with a 500.
    pub fn fail_part(&self, part_number: u32) {
        self.inner.lock().unwrap().fail_part = Some(part_number);
    }

    /// Answer completions with 200 OK and an error document.
    pub fn fail_completion(&self) {
        self.inner.lock().unwrap().fail_completion = true;
    }
}

async fn handle(
    State(inner): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut inner = inner.lock().unwrap();
    respond(&mut inner, &method, &uri, &headers, body)
}

fn respond(inner: &mut Inner, method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> Response {
    if let Some(auth) = header(headers, AUTHORIZATION.as_str()) {
        inner.authorizations.push(auth);
    }
    let path = percent_decode_str(uri.path()).decode_utf8_lossy().into_owned();
    let trimmed = path.trim_start_matches('/');
    let (bucket, key) = match trimmed.split_once('/') {
        Some((bucket, key)) => (bucket.to_string(), key.to_string()),
        None => (trimmed.to_string(), String::new()),
    };
    let query: HashMap<String, String> = url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
        .into_owned()
        .collect();

    if !inner.buckets.contains_key(&bucket) {
        return error(StatusCode::NOT_FOUND, "NoSuchBucket", "The specified bucket does not exist");
    }
    let sse = header(headers, "x-amz-server-side-encryption");

    if *method == Method::GET && key.is_empty() {
        list(inner, &bucket, &query)
    } else if *method == Method::GET {
        get(inner, &bucket, &key)
    } else if *method == Method::HEAD {
        head(inner, &bucket, &key)
    } else if *method == Method::PUT && query.contains_key("partNumber") {
        upload_part(inner, &bucket, &key, &query, body)
    } else if *method == Method::PUT && headers.contains_key("x-amz-copy-source") {
        let source = header(headers, "x-amz-copy-source").unwrap_or_default();
        copy(inner, &bucket, &key, &source, sse)
    } else if *method == Method::PUT {
        let etag = etag_of(&body);
        store(inner, &bucket, &key, body.to_vec(), sse);
        (StatusCode::OK, [(ETAG, etag)]).into_response()
    } else if *method == Method::POST && query.contains_key("uploads") {
        initiate(inner, &bucket, &key, sse)
    } else if *method == Method::POST && query.contains_key("uploadId") {
        complete(inner, &bucket, &key, &query, &body)
    } else if *method == Method::DELETE && query.contains_key("uploadId") {
        match inner.uploads.remove(&query["uploadId"]) {
            Some(_) => StatusCode::NO_CONTENT.into_response(),
            None => no_such_upload(),
        }
    } else if *method == Method::DELETE {
        if let Some(objects) = inner.buckets.get_mut(&bucket) {
            objects.remove(&key);
        }
        StatusCode::NO_CONTENT.into_response()
    } else {
        error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "unsupported request")
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn etag_of(data: &[u8]) -> String {
    format!("\"{}\"", &hex::encode(Sha256::digest(data))[..32])
}

fn error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        [(CONTENT_TYPE, "application/xml")],
        format!("<Error><Code>{code}</Code><Message>{message}</Message></Error>"),
    )
        .into_response()
}

fn no_such_key() -> Response {
    error(StatusCode::NOT_FOUND, "NoSuchKey", "The specified key does not exist.")
}

fn no_such_upload() -> Response {
    error(StatusCode::NOT_FOUND, "NoSuchUpload", "The specified upload does not exist.")
}

fn xml_ok(body: String) -> Response {
    (StatusCode::OK, [(CONTENT_TYPE, "application/xml")], body).into_response()
}

fn store(inner: &mut Inner, bucket: &str, key: &str, data: Vec<u8>, sse: Option<String>) {
    if let Some(objects) = inner.buckets.get_mut(bucket) {
        objects.insert(
            key.to_string(),
            FakeObject {
                data,
                last_modified: Utc::now(),
                sse,
            },
        );
    }
}

fn list(inner: &Inner, bucket: &str, query: &HashMap<String, String>) -> Response {
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let max_keys: usize = query.get("max-keys").and_then(|v| v.parse().ok()).unwrap_or(1000);
    let start_after = query.get("continuation-token").cloned();

    let mut matching = inner.buckets[bucket]
        .iter()
        .filter(|(key, _)| key.starts_with(&prefix))
        .filter(|(key, _)| start_after.as_ref().map_or(true, |after| key.as_str() > after.as_str()));
    let page: Vec<_> = matching.by_ref().take(max_keys).collect();
    let truncated = matching.next().is_some();

    let result = xml::ListBucketResult {
        contents: page
            .iter()
            .map(|(key, object)| xml::ListEntry {
                key: key.to_string(),
                last_modified: object.last_modified.to_rfc3339_opts(SecondsFormat::Millis, true),
                size: object.data.len() as u64,
            })
            .collect(),
        is_truncated: truncated,
        next_continuation_token: if truncated {
            page.last().map(|(key, _)| key.to_string())
        } else {
            None
        },
    };
    xml_ok(quick_xml::se::to_string(&result).unwrap())
}

fn get(inner: &Inner, bucket: &str, key: &str) -> Response {
    match inner.buckets[bucket].get(key) {
        Some(object) => (
            StatusCode::OK,
            [(LAST_MODIFIED, http_date(object.last_modified))],
            object.data.clone(),
        )
            .into_response(),
        None => no_such_key(),
    }
}

fn head(inner: &Inner, bucket: &str, key: &str) -> Response {
    match inner.buckets[bucket].get(key) {
        Some(object) => (
            StatusCode::OK,
            [
                (LAST_MODIFIED, http_date(object.last_modified)),
                (CONTENT_LENGTH, object.data.len().to_string()),
            ],
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn copy(inner: &mut Inner, bucket: &str, key: &str, source: &str, sse: Option<String>) -> Response {
    let source = percent_decode_str(source).decode_utf8_lossy().into_owned();
    let Some((src_bucket, src_key)) = source.trim_start_matches('/').split_once('/') else {
        return error(StatusCode::BAD_REQUEST, "InvalidArgument", "bad copy source");
    };
    let Some(objects) = inner.buckets.get(src_bucket) else {
        return error(StatusCode::NOT_FOUND, "NoSuchBucket", "The specified bucket does not exist");
    };
    let Some(object) = objects.get(src_key) else {
        return no_such_key();
    };
    let data = object.data.clone();
    let etag = etag_of(&data);
    store(inner, bucket, key, data, sse);
    xml_ok(format!("<CopyObjectResult><ETag>{etag}</ETag></CopyObjectResult>"))
}

fn initiate(inner: &mut Inner, bucket: &str, key: &str, sse: Option<String>) -> Response {
    inner.next_upload += 1;
    let upload_id = format!("upload-{}", inner.next_upload);
    inner.uploads.insert(
        upload_id.clone(),
        Upload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            sse,
            parts: BTreeMap::new(),
        },
    );
    let result = xml::InitiateMultipartUploadResult {
        bucket: bucket.to_string(),
        key: key.to_string(),
        upload_id,
    };
    xml_ok(quick_xml::se::to_string(&result).unwrap())
}

fn upload_part(
    inner: &mut Inner,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> Response {
    let Some(part_number) = query.get("partNumber").and_then(|n| n.parse::<u32>().ok()) else {
        return error(StatusCode::BAD_REQUEST, "InvalidArgument", "bad part number");
    };
    if inner.fail_part == Some(part_number) {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", "injected part failure");
    }
    let upload_id = query.get("uploadId").cloned().unwrap_or_default();
    let Some(upload) = inner.uploads.get_mut(&upload_id) else {
        return no_such_upload();
    };
    if upload.bucket != bucket || upload.key != key {
        return no_such_upload();
    }
    let etag = etag_of(&body);
    upload.parts.insert(part_number, (etag.clone(), body));
    (StatusCode::OK, [(ETAG, etag)]).into_response()
}

fn complete(
    inner: &mut Inner,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Response {
    let upload_id = query.get("uploadId").cloned().unwrap_or_default();
    if inner.fail_completion {
        return xml_ok("<Error><Code>InternalError</Code><Message>injected completion failure</Message></Error>".into());
    }
    let Some(upload) = inner.uploads.get(&upload_id) else {
        return no_such_upload();
    };
    if upload.bucket != bucket || upload.key != key {
        return no_such_upload();
    }
    let request: xml::CompleteMultipartUpload = match quick_xml::de::from_str(&String::from_utf8_lossy(body)) {
        Ok(request) => request,
        Err(_) => return error(StatusCode::BAD_REQUEST, "MalformedXML", "bad completion body"),
    };

    let mut data = Vec::new();
    let mut previous = 0;
    for part in &request.parts {
        if part.part_number <= previous {
            return error(StatusCode::BAD_REQUEST, "InvalidPartOrder", "parts must be ascending");
        }
        previous = part.part_number;
        match upload.parts.get(&part.part_number) {
            Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
            _ => return error(StatusCode::BAD_REQUEST, "InvalidPart", "unknown part or etag"),
        }
    }

    let sse = upload.sse.clone();
    inner.uploads.remove(&upload_id);
    store(inner, bucket, key, data, sse);
    xml_ok(format!(
        "<CompleteMultipartUploadResult><Bucket>{bucket}</Bucket><Key>{key}</Key></CompleteMultipartUploadResult>"
    ))
}
