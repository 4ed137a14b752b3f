//! Origin HTTP layer.
//!
//! One shared `reqwest::Client` (pooling, DNS cache) serves every worker and
//! playlist fetch. Range fetches return the response metadata the pipelines
//! need (`Content-Range` total, content type, whether the origin honored the
//! range) plus a plain byte stream; retry policy for small whole resources
//! (playlists) lives here, while workers run their own retry loop so they can
//! resume from a byte offset.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};

/// A boxed stream of origin body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, ProxyError>>;

/// One origin response with the metadata the pipelines care about.
pub struct OriginResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type` echoed to clients.
    pub content_type: Option<String>,
    /// `Content-Length` of this response body, when present.
    pub content_length: Option<u64>,
    /// Full resource length: `Content-Range` total, else `Content-Length` on
    /// a plain 200.
    pub total_bytes: Option<u64>,
    /// Whether the origin answered the range request with 206.
    pub honors_range: bool,
    /// Body chunks.
    pub stream: ByteStream,
}

/// Shared origin fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    read_timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
    max_retry_delay: Duration,
}

impl HttpFetcher {
    pub fn new(config: &ProxyConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            read_timeout: config.read_timeout,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
            max_retry_delay: config.max_retry_delay,
        }
    }

    /// Idle timeout between body chunks; enforced by stream consumers.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Issue one ranged GET. `end` is inclusive; `None` requests to EOF.
    ///
    /// No retry here: the worker owns the retry loop so it can resume with an
    /// updated offset instead of refetching from scratch.
    pub async fn get_range(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
        start: u64,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> ProxyResult<OriginResponse> {
        let range = match end {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        };
        let request = self
            .client
            .get(url.clone())
            .header("Range", range)
            .headers(to_header_map(headers));

        self.send(url, request, cancel).await
    }

    /// Issue one plain GET (pass-through, no `Range`).
    pub async fn get(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> ProxyResult<OriginResponse> {
        let request = self.client.get(url.clone()).headers(to_header_map(headers));
        self.send(url, request, cancel).await
    }

    /// Download a small whole resource (playlist, key) with retries.
    pub async fn fetch_small(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> ProxyResult<(Bytes, Option<String>)> {
        let mut last_error: Option<ProxyError> = None;
        let mut delay = self.retry_base_delay;

        for attempt in 0..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(ProxyError::Cancelled);
            }

            match self.fetch_small_once(url, headers, cancel).await {
                Ok(out) => {
                    if attempt > 0 {
                        debug!(url = %url, attempts = attempt + 1, "fetch succeeded after retry");
                    }
                    return Ok(out);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    debug!(
                        url = %url,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        "fetch attempt failed: {e}"
                    );
                    last_error = Some(e);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                        _ = tokio::time::sleep(delay) => {},
                    }
                    delay = (delay * 2).min(self.max_retry_delay);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ProxyError::msg("fetch failed with no error")))
    }

    async fn fetch_small_once(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> ProxyResult<(Bytes, Option<String>)> {
        let response = self.get(url, headers, cancel).await?;
        let content_type = response.content_type.clone();
        let mut stream = response.stream;
        let mut buf = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                item = tokio::time::timeout(self.read_timeout, stream.next()) => match item {
                    Ok(v) => v,
                    Err(_) => return Err(ProxyError::timeout(url.to_string())),
                },
            };
            match next {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok((Bytes::from(buf), content_type))
    }

    async fn send(
        &self,
        url: &Url,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> ProxyResult<OriginResponse> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            res = request.send() => res.map_err(|e| map_transport_error(url, e))?,
        };

        let status = response.status().as_u16();
        if !(response.status().is_success()) {
            return Err(ProxyError::origin_status(status, url.to_string()));
        }

        let headers = response.headers();
        let content_type = headers
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let content_length = headers
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let content_range_total = headers
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);

        let honors_range = status == 206;
        let total_bytes = match (content_range_total, content_length, status) {
            (Some(total), _, _) => Some(total),
            (None, Some(len), 200) => Some(len),
            _ => None,
        };

        let url_owned = url.to_string();
        let stream = response
            .bytes_stream()
            .map(move |res| {
                res.map_err(|e| {
                    ProxyError::OriginUnreachable(format!("stream read error (url={url_owned}): {e}"))
                })
            })
            .boxed();

        Ok(OriginResponse {
            status,
            content_type,
            content_length,
            total_bytes,
            honors_range,
            stream,
        })
    }
}

fn map_transport_error(url: &Url, e: reqwest::Error) -> ProxyError {
    if e.is_timeout() || e.is_connect() {
        ProxyError::OriginUnreachable(format!("{url}: {e}"))
    } else {
        ProxyError::OriginProtocol(format!("{url}: {e}"))
    }
}

fn to_header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        out.insert(name, value);
    }
    out
}

/// Parse the `Content-Range` header to extract the total length.
/// Expected formats:
/// - "bytes 0-999/12345"
/// - "bytes */12345"
pub fn parse_content_range_total(header_val: &str) -> Option<u64> {
    let idx = header_val.rfind('/')?;
    let total_str = header_val.get(idx + 1..)?.trim();
    if total_str == "*" {
        None
    } else {
        total_str.parse::<u64>().ok()
    }
}
