//! HTTP/1.1 request framing and origin resolution.
//!
//! Requests are framed byte-oriented: read until `\r\n\r\n` with an explicit
//! header size cap, then parse the request line and header block. Header
//! names are folded to lowercase and values trimmed, so lookups are
//! case-insensitive.
//!
//! The origin URL for a request is resolved in order of preference:
//! 1. an absolute-form target (`GET http://…` or the percent-encoded
//!    `/https%3A%2F%2F…` form produced by playlist rewriting),
//! 2. an `origin=` query parameter,
//! 3. synthesis from `Host` plus `X-Forwarded-Proto` (default `http`).

use std::collections::HashMap;
use std::net::SocketAddr;

use percent_encoding::percent_decode_str;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::error::{ProxyError, ProxyResult};

/// Upper bound on the request head (request line + headers).
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

/// One parsed client request.
#[derive(Clone, Debug)]
pub struct ClientRequest {
    pub method: String,
    /// Raw request target as sent by the client.
    pub target: String,
    /// Header map with lowercase names and trimmed values.
    pub headers: HashMap<String, String>,
}

impl ClientRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Read one request head from the client socket.
pub async fn read_request(stream: &mut TcpStream) -> ProxyResult<ClientRequest> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(head_len) = find_head_end(&buf) {
            return parse_head(&buf[..head_len]);
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProxyError::BadRequest("request head too large".into()));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::ClientDisconnect);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse a request head (without the trailing `\r\n\r\n`).
pub fn parse_head(head: &[u8]) -> ProxyResult<ClientRequest> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::BadRequest("request head is not valid UTF-8".into()))?;

    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| ProxyError::BadRequest("empty request".into()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing method".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing request target".into()))?
        .to_string();
    let protocol = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing protocol".into()))?;
    if !protocol.starts_with("HTTP/") {
        return Err(ProxyError::BadRequest(format!(
            "unsupported protocol {protocol}"
        )));
    }

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProxyError::BadRequest(format!("malformed header {line:?}")));
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    if headers.is_empty() {
        return Err(ProxyError::BadRequest("empty header block".into()));
    }

    Ok(ClientRequest {
        method,
        target,
        headers,
    })
}

/// Resolve the origin URL a request addresses.
pub fn resolve_origin(request: &ClientRequest) -> ProxyResult<Url> {
    let (path, query) = match request.target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (request.target.as_str(), None),
    };

    // Absolute-form target, possibly percent-encoded behind a leading slash.
    let candidate = percent_decode_str(path.trim_start_matches('/'))
        .decode_utf8()
        .map_err(|_| ProxyError::BadRequest("invalid percent-encoding in target".into()))?;
    if candidate.starts_with("http://") || candidate.starts_with("https://") {
        return Url::parse(&candidate).map_err(ProxyError::url_parse);
    }

    // `origin=` query parameter.
    if let Some(query) = query {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if name == "origin" {
                return Url::parse(&value).map_err(ProxyError::url_parse);
            }
        }
    }

    // Synthesize from Host.
    let host = request
        .header("host")
        .ok_or_else(|| ProxyError::BadRequest("no origin and no Host header".into()))?;
    let proto = request.header("x-forwarded-proto").unwrap_or("http");
    Url::parse(&format!("{proto}://{host}{}", request.target)).map_err(ProxyError::url_parse)
}

/// Headers forwarded to the origin.
///
/// Strips a `Host` that points at the proxy itself (a foreign `Host` is
/// kept), the `X-Forwarded-*` hop headers, the client's `Range` (pipelines
/// issue their own), and `Connection`.
pub fn forward_headers(
    headers: &HashMap<String, String>,
    proxy_addr: SocketAddr,
) -> HashMap<String, String> {
    let proxy_host = proxy_addr.to_string();
    let proxy_ip = proxy_addr.ip().to_string();

    headers
        .iter()
        .filter(|(name, value)| match name.as_str() {
            "host" => **value != proxy_host && **value != proxy_ip,
            "x-forwarded-host" | "x-forwarded-for" | "x-forwarded-proto" => false,
            "range" | "connection" => false,
            _ => true,
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Parse a client `Range` header into an inclusive `(start, end)` interval.
///
/// Only the `bytes=S-E?` single-range form is honored; anything else
/// (suffix ranges, multipart ranges) is treated as a full-resource request.
pub fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim();
    let end = if end.is_empty() {
        None
    } else {
        let end = end.parse::<u64>().ok()?;
        if end < start {
            return None;
        }
        Some(end)
    };
    Some((start, end))
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

/// Write a response head.
pub async fn write_response_head(
    stream: &mut TcpStream,
    status: u16,
    headers: &[(&str, String)],
) -> std::io::Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, status_reason(status));
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("Connection: close\r\n\r\n");
    stream.write_all(head.as_bytes()).await
}

/// Write a complete small response and flush it.
pub async fn write_simple_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    write_response_head(
        stream,
        status,
        &[
            ("Content-Type", content_type.to_string()),
            ("Content-Length", body.len().to_string()),
        ],
    )
    .await?;
    stream.write_all(body).await?;
    stream.flush().await
}
