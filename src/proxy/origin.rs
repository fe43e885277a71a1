//! Record-mode origin fetch
//!
//! Dials the resolved origin address directly and speaks HTTP/1.1 over
//! the raw stream, so no request ever travels through the redirected
//! local resolver.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderName, HOST};
use hyper::{HeaderMap, Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::fingerprint::is_hop_by_hop;
use crate::{ReplayError, Result};

/// Timeout for establishing the origin TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A complete response fetched from an origin server
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// HTTP status code
    pub status: u16,
    /// Canonical reason phrase for the status
    pub reason: String,
    /// Response headers in received order
    pub headers: Vec<(String, String)>,
    /// Whether the origin used chunked transfer encoding
    pub chunked: bool,
    /// Fully buffered response body
    pub body: Vec<u8>,
}

/// Fetch a request from the origin at `addr`, forwarding it unchanged
/// except for hop-by-hop headers
///
/// # Errors
///
/// Returns [`ReplayError::Origin`] if the connection, request, or body
/// read fails or exceeds `read_timeout`
pub async fn fetch_origin(
    addr: SocketAddr,
    host: &str,
    method: Method,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
    read_timeout: Duration,
) -> Result<FetchedResponse> {
    debug!(%addr, %host, %method, path, "fetching origin");

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ReplayError::Origin(format!("connect timeout to {addr}")))?
        .map_err(|e| ReplayError::Origin(format!("connect to {addr}: {e}")))?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ReplayError::Origin(format!("handshake with {addr}: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("origin connection closed: {e}");
        }
    });

    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) && name != &HOST {
            builder = builder.header(name.clone(), value.clone());
        }
    }
    builder = builder.header(HOST, host);
    let request = builder
        .body(Full::new(body))
        .map_err(|e| ReplayError::Origin(format!("building origin request: {e}")))?;

    let response = tokio::time::timeout(read_timeout, sender.send_request(request))
        .await
        .map_err(|_| ReplayError::Origin(format!("read timeout from {addr}")))?
        .map_err(|e| ReplayError::Origin(format!("request to {addr}: {e}")))?;

    let status = response.status();
    let chunked = response
        .headers()
        .get(HeaderName::from_static("transfer-encoding"))
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_lowercase().contains("chunked"));
    let response_headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    // A failure mid-body means no complete response; the caller must not
    // commit anything to the archive.
    let body = tokio::time::timeout(read_timeout, response.into_body().collect())
        .await
        .map_err(|_| ReplayError::Origin(format!("body read timeout from {addr}")))?
        .map_err(|e| {
            warn!(%addr, "origin body failed mid-stream: {e}");
            ReplayError::Origin(format!("reading body from {addr}: {e}"))
        })?
        .to_bytes()
        .to_vec();

    Ok(FetchedResponse {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("").to_string(),
        headers: response_headers,
        chunked,
        body,
    })
}
