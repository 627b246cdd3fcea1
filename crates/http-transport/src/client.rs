//! HTTP chunk transport.
//!
//! Uploads go to the sync server as multipart `POST /upload` requests, one
//! chunk per request. Downloads are ranged `GET`s against either a beatmap
//! mirror or the server's `/files` tree.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use beatsync_engine::{Ack, ChunkDownloader, ChunkRequest, ChunkUploader, TransportError};
use beatsync_protocol::{Digest, FileManifestEntry};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::config::{DownloadRoute, HttpConfig};

/// Response header carrying the digest the server computed for an uploaded chunk.
pub const CHUNK_DIGEST_HEADER: &str = "x-chunk-sha256";

/// Characters left unescaped in path segments and query values.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Longest error body kept in an [`HttpError::Status`].
const MAX_ERROR_BODY: usize = 256;

/// Deadline for establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the HTTP transport.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("response too short: wanted bytes {start}..{end}, body has {actual}")]
    ShortBody { start: u64, end: u64, actual: usize },

    #[error("invalid chunk digest header: {0}")]
    InvalidDigest(String),

    #[error("no content length for {0}")]
    MissingLength(String),

    #[error("partial response starts at {actual:?}, requested {expected}")]
    MisalignedRange { expected: u64, actual: Option<u64> },

    #[error("not a mirror set id: {0:?}")]
    InvalidMirrorId(String),
}

impl From<HttpError> for TransportError {
    fn from(err: HttpError) -> Self {
        let transient = match &err {
            HttpError::Http(e) => !(e.is_builder() || e.is_redirect()),
            HttpError::Status { status, .. } => is_transient_status(*status),
            HttpError::ShortBody { .. } | HttpError::MisalignedRange { .. } => true,
            HttpError::InvalidDigest(_)
            | HttpError::MissingLength(_)
            | HttpError::InvalidMirrorId(_) => false,
        };
        if transient {
            TransportError::transient(err.to_string())
        } else {
            TransportError::permanent(err.to_string())
        }
    }
}

/// Returns `true` when a non-success status is worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..600).contains(&status)
}

/// Mirror path of a beatmap set archive.
///
/// Sets are sharded by the first four digits of the id (`0` for ids of up to
/// four digits) and then by the last four. Only numeric ids exist on a mirror.
pub fn mirror_path(online_id: &str) -> Result<String, HttpError> {
    if online_id.is_empty() || !online_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HttpError::InvalidMirrorId(online_id.to_string()));
    }
    let len = online_id.len();
    let head = if len <= 4 { "0" } else { &online_id[..4] };
    let tail = &online_id[len.saturating_sub(4)..];
    Ok(format!("/beatmaps/{head}/{tail}/full?filename={online_id}"))
}

/// `/files/<relative_path>` with each segment escaped.
pub fn files_path(relative_path: &str) -> String {
    let encoded: Vec<String> = relative_path
        .split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect();
    format!("/files/{}", encoded.join("/"))
}

/// First byte position of a `Content-Range: bytes a-b/total` value.
pub fn content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

/// Inclusive byte range header value for `length` bytes at `offset`.
pub fn range_header(offset: u64, length: u32) -> String {
    let end = offset + u64::from(length).max(1) - 1;
    format!("bytes={offset}-{end}")
}

/// Chunk transport over HTTP.
pub struct HttpTransport {
    http: reqwest::Client,
    config: HttpConfig,
}

impl HttpTransport {
    /// Creates a transport with its own connection pool.
    pub fn new(config: HttpConfig) -> Result<Self, HttpError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("beatsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(http, config))
    }

    /// Creates a transport sharing an existing client.
    pub fn with_client(http: reqwest::Client, config: HttpConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Full URL a file is downloaded from.
    pub fn download_url(&self, file_id: &str, relative_path: &str) -> Result<String, HttpError> {
        Ok(match self.config.route {
            DownloadRoute::Mirror => format!(
                "{}{}",
                self.config.mirror_url.trim_end_matches('/'),
                mirror_path(file_id)?
            ),
            DownloadRoute::Files => format!(
                "{}{}",
                self.config.base_url.trim_end_matches('/'),
                files_path(relative_path)
            ),
        })
    }

    /// Uploads one chunk.
    pub async fn upload(&self, request: &ChunkRequest, data: &[u8]) -> Result<Ack, HttpError> {
        let url = format!("{}/upload", self.config.base_url.trim_end_matches('/'));
        let filepath = format!(
            "{}/{}",
            self.config.namespace.trim_end_matches('/'),
            request.relative_path
        );
        let file_name = request
            .relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&request.relative_path)
            .to_string();

        let part = Part::bytes(data.to_vec())
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
        let mut form = Form::new()
            .text("filepath", filepath)
            .text("fileId", request.file_id.clone())
            .text("index", request.index.to_string())
            .text("offset", request.offset.to_string())
            .text("length", request.length.to_string());
        if let Some(digest) = request.digest {
            form = form.text("digest", digest.to_hex());
        }
        let form = form.part("file", part);

        debug!(
            file_id = %request.file_id,
            index = request.index,
            bytes = data.len(),
            "uploading chunk"
        );
        let resp = self.http.post(&url).multipart(form).send().await?;
        let status = resp.status();
        if !matches!(
            status,
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT
        ) {
            return Err(status_error(resp).await);
        }

        let digest = match resp.headers().get(CHUNK_DIGEST_HEADER) {
            Some(value) => {
                let text = value
                    .to_str()
                    .map_err(|e| HttpError::InvalidDigest(e.to_string()))?;
                Some(
                    Digest::from_hex(text.trim())
                        .map_err(|e| HttpError::InvalidDigest(e.to_string()))?,
                )
            }
            None => None,
        };
        Ok(Ack { digest })
    }

    /// Fetches one chunk with a ranged `GET`.
    ///
    /// A server that ignores the range and answers 200 with the whole file
    /// has its body sliced down to the requested bytes.
    pub async fn download(&self, request: &ChunkRequest) -> Result<Vec<u8>, HttpError> {
        if request.length == 0 {
            return Ok(Vec::new());
        }
        let url = self.download_url(&request.file_id, &request.relative_path)?;
        debug!(
            file_id = %request.file_id,
            index = request.index,
            offset = request.offset,
            length = request.length,
            "fetching chunk"
        );

        let resp = self
            .http
            .get(&url)
            .header(RANGE, range_header(request.offset, request.length))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(resp).await);
        }

        if status == StatusCode::PARTIAL_CONTENT {
            let actual = resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_start);
            if actual != Some(request.offset) {
                return Err(HttpError::MisalignedRange {
                    expected: request.offset,
                    actual,
                });
            }
            return Ok(resp.bytes().await?.to_vec());
        }

        let body = resp.bytes().await?;

        let start = request.offset;
        let end = start + u64::from(request.length);
        if (body.len() as u64) < end {
            return Err(HttpError::ShortBody {
                start,
                end,
                actual: body.len(),
            });
        }
        Ok(body[start as usize..end as usize].to_vec())
    }

    /// Size of a remote file, from a `HEAD` request.
    pub async fn content_length(&self, entry: &FileManifestEntry) -> Result<u64, HttpError> {
        let url = self.download_url(&entry.id, &entry.relative_path)?;
        let resp = self.http.head(&url).send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .ok_or(HttpError::MissingLength(url))
    }
}

async fn status_error(resp: reqwest::Response) -> HttpError {
    let status = resp.status().as_u16();
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    HttpError::Status { status, body }
}

impl ChunkUploader for HttpTransport {
    fn send_chunk<'a>(
        &'a self,
        request: &'a ChunkRequest,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Ack, TransportError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.upload(request, data).await?) })
    }
}

impl ChunkDownloader for HttpTransport {
    fn fetch_chunk<'a>(
        &'a self,
        request: &'a ChunkRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, TransportError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.download(request).await?) })
    }
}
