//! Loopback forwarding bridge: replays tunneled HTTP/RTSP requests onto the
//! co-located Sunshine servers over short-lived TCP connections and captures
//! the responses.
//!
//! Requests are composed and responses parsed byte-by-byte rather than
//! through an HTTP client: the upstream is a fixed, co-located server and the
//! reply must preserve exactly what it said, RTSP included.

use std::fmt::Write as _;

use anyhow::{bail, Context, Result};
use log::{debug, error};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use starbeam_proto::message::{HeaderMap, HttpRequest, HttpResponse, RtspRequest, RtspResponse};

use crate::net::{map_port, PORT_HTTP, PORT_HTTPS, PORT_RTSP_SETUP};

#[derive(Debug, Clone, Copy)]
pub struct LoopbackBridge {
    base_port: u16,
}

impl LoopbackBridge {
    pub fn new(base_port: u16) -> Self {
        Self { base_port }
    }

    /// Forward one tunneled HTTP request. Failures never escape: anything
    /// that goes wrong becomes a 500 reply with the request's id.
    pub async fn forward_http(&self, req: HttpRequest) -> HttpResponse {
        let id = req.id;
        match self.try_forward_http(&req).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    "starbeam::bridge: HTTP {} {} failed: {e:#}",
                    req.method, req.path
                );
                HttpResponse {
                    id,
                    status: 500,
                    headers: HeaderMap::new(),
                    body: Some("Internal Server Error".to_string()),
                }
            }
        }
    }

    /// Forward one tunneled RTSP request; failures become a 500 reply.
    pub async fn forward_rtsp(&self, req: RtspRequest) -> RtspResponse {
        let id = req.id;
        match self.try_forward_rtsp(&req).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    "starbeam::bridge: RTSP {} {} failed: {e:#}",
                    req.method, req.uri
                );
                RtspResponse {
                    id,
                    status: 500,
                    reason: "Internal Server Error".to_string(),
                    headers: HeaderMap::new(),
                    body: None,
                }
            }
        }
    }

    async fn try_forward_http(&self, req: &HttpRequest) -> Result<HttpResponse> {
        let local_port = map_port(
            self.base_port,
            if req.is_https { PORT_HTTPS } else { PORT_HTTP },
        );
        debug!(
            "starbeam::bridge: connecting to local {} server at 127.0.0.1:{local_port}",
            if req.is_https { "HTTPS" } else { "HTTP" }
        );
        let mut stream = TcpStream::connect(("127.0.0.1", local_port))
            .await
            .with_context(|| format!("connect 127.0.0.1:{local_port}"))?;

        let body = req.body.as_deref().unwrap_or("");
        let mut head = String::new();
        if let Some(query) = req.query.as_deref().filter(|q| !q.is_empty()) {
            let _ = write!(head, "{} {}?{} HTTP/1.1\r\n", req.method, req.path, query);
        } else {
            let _ = write!(head, "{} {} HTTP/1.1\r\n", req.method, req.path);
        }
        let _ = write!(head, "Host: 127.0.0.1:{local_port}\r\n");
        for (key, value) in &req.headers {
            // Hop-by-hop headers belong to the relay leg, not the loopback one.
            if key.eq_ignore_ascii_case("host")
                || key.eq_ignore_ascii_case("connection")
                || key.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            let _ = write!(head, "{key}: {value}\r\n");
        }
        let _ = write!(head, "X-Forwarded-For: {}\r\n", req.client_addr);
        let _ = write!(head, "X-Starbeam-Client: {}\r\n", req.client_addr);
        if !body.is_empty() {
            let _ = write!(head, "Content-Length: {}\r\n", body.len());
        }
        head.push_str("Connection: close\r\n\r\n");

        stream.write_all(head.as_bytes()).await?;
        if !body.is_empty() {
            stream.write_all(body.as_bytes()).await?;
        }

        let upstream = read_response(&mut stream, true).await?;
        debug!(
            "starbeam::bridge: HTTP {} {} -> {}",
            req.method, req.path, upstream.status
        );

        let content_type = upstream
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        let mut headers = HeaderMap::new();
        if !content_type.is_empty() {
            headers.insert("Content-Type".to_string(), content_type);
        }

        Ok(HttpResponse {
            id: req.id,
            status: upstream.status,
            headers,
            body: non_empty_body(upstream.body),
        })
    }

    async fn try_forward_rtsp(&self, req: &RtspRequest) -> Result<RtspResponse> {
        let rtsp_port = map_port(self.base_port, PORT_RTSP_SETUP);
        debug!("starbeam::bridge: connecting to local RTSP server at 127.0.0.1:{rtsp_port}");
        let mut stream = TcpStream::connect(("127.0.0.1", rtsp_port))
            .await
            .with_context(|| format!("connect 127.0.0.1:{rtsp_port}"))?;

        let body = req.body.as_deref().unwrap_or("");
        let mut head = String::new();
        let _ = write!(head, "{} {} RTSP/1.0\r\n", req.method, req.uri);
        for (key, value) in &req.headers {
            let _ = write!(head, "{key}: {value}\r\n");
        }
        let _ = write!(head, "X-Starbeam-Client: {}\r\n", req.client_addr);
        if !body.is_empty() {
            let _ = write!(head, "Content-Length: {}\r\n", body.len());
        }
        head.push_str("\r\n");

        stream.write_all(head.as_bytes()).await?;
        if !body.is_empty() {
            stream.write_all(body.as_bytes()).await?;
        }

        let upstream = read_response(&mut stream, false).await?;
        debug!(
            "starbeam::bridge: RTSP {} {} -> {}",
            req.method, req.uri, upstream.status
        );

        Ok(RtspResponse {
            id: req.id,
            status: upstream.status,
            reason: upstream.reason,
            headers: upstream.headers,
            body: non_empty_body(upstream.body),
        })
    }
}

fn non_empty_body(bytes: Vec<u8>) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

struct UpstreamResponse {
    status: u16,
    reason: String,
    headers: HeaderMap,
    body: Vec<u8>,
}

/// Read and parse an HTTP/1.1- or RTSP/1.0-shaped response.
///
/// Header values lose at most one leading space; header names are matched
/// case-insensitively for `Content-Length`. With no usable `Content-Length`,
/// HTTP (`read_to_eof_without_length`) drains the stream to EOF, which the
/// upstream's `Connection: close` bounds; RTSP responses carry no body then.
async fn read_response(
    stream: &mut TcpStream,
    read_to_eof_without_length: bool,
) -> Result<UpstreamResponse> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed before response headers");
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head =
        std::str::from_utf8(&buf[..header_end]).context("response headers are not UTF-8")?;
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let (status, reason) = parse_status_line(status_line)?;

    let mut headers = HeaderMap::new();
    let mut content_length: Option<usize> = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        if key.eq_ignore_ascii_case("content-length") {
            content_length = Some(
                value
                    .trim()
                    .parse()
                    .with_context(|| format!("bad Content-Length '{value}'"))?,
            );
        }
        headers.insert(key.to_string(), value.to_string());
    }

    let mut body = buf.split_off(header_end + 4);
    match content_length {
        Some(len) if len > 0 => {
            while body.len() < len {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..n]);
            }
            body.truncate(len);
        }
        _ => {
            if read_to_eof_without_length {
                loop {
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&chunk[..n]);
                }
            } else {
                body.clear();
            }
        }
    }

    Ok(UpstreamResponse {
        status,
        reason,
        headers,
        body,
    })
}

fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let _version = parts.next().context("missing protocol version")?;
    let status = parts
        .next()
        .with_context(|| format!("status line '{line}' has no status code"))?
        .parse::<u16>()
        .with_context(|| format!("bad status code in '{line}'"))?;
    let reason = parts.next().unwrap_or("").trim_end_matches('\r').to_string();
    Ok((status, reason))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
