//! Shared request handler for record and replay

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_LENGTH;
use hyper::{Request, Response, StatusCode};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::archive::{epoch_millis, Archive, ArchiveWriter, ResponseRecord};
use crate::dns::RealDns;
use crate::fingerprint::{is_hop_by_hop, RequestKey};
use crate::summary::SessionStats;
use crate::{ReplayError, Result};

use super::inject::{inject, is_html};
use super::origin::{fetch_origin, FetchedResponse};
use super::ORIGIN_READ_TIMEOUT;

/// Record-mode engine: fetch from origins and commit to the archive
pub struct RecordEngine {
    resolver: RealDns,
    origin_port: u16,
    writer: Mutex<Option<ArchiveWriter>>,
    abort: broadcast::Sender<()>,
}

/// Replay-mode engine: answer strictly from the archive
pub struct ReplayEngine {
    archive: Archive,
}

/// Session engine, selected at startup
pub enum Engine {
    /// Recording against live origins
    Record(RecordEngine),
    /// Replaying the archive
    Replay(ReplayEngine),
}

/// State shared by every connection handler
pub struct ProxyState {
    engine: Engine,
    inject_script: bool,
    stats: SessionStats,
}

impl ProxyState {
    /// Build record-mode state
    ///
    /// `abort` is signalled when an archive commit fails, which ends the
    /// session rather than silently dropping exchanges.
    #[must_use]
    pub fn record(
        writer: ArchiveWriter,
        resolver: RealDns,
        origin_port: u16,
        abort: broadcast::Sender<()>,
    ) -> Self {
        Self {
            engine: Engine::Record(RecordEngine {
                resolver,
                origin_port,
                writer: Mutex::new(Some(writer)),
                abort,
            }),
            inject_script: false,
            stats: SessionStats::new(),
        }
    }

    /// Build replay-mode state
    #[must_use]
    pub fn replay(archive: Archive, inject_script: bool) -> Self {
        Self {
            engine: Engine::Replay(ReplayEngine { archive }),
            inject_script,
            stats: SessionStats::new(),
        }
    }

    /// Per-URL timing collector
    #[must_use]
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Replay hit/miss counters (zero in record mode)
    #[must_use]
    pub fn hit_miss(&self) -> (u64, u64) {
        match &self.engine {
            Engine::Replay(replay) => (
                replay.archive.hit_count() as u64,
                replay.archive.miss_count() as u64,
            ),
            Engine::Record(_) => (0, 0),
        }
    }

    /// Finalize the session archive and return its identity
    ///
    /// In record mode this syncs the writer; in replay mode the identity
    /// of the loaded archive is returned.
    ///
    /// # Errors
    ///
    /// Returns error if the record-mode writer fails to sync
    pub async fn finalize(&self) -> Result<String> {
        match &self.engine {
            Engine::Replay(replay) => Ok(replay.archive.identity().to_string()),
            Engine::Record(record) => {
                let writer = record.writer.lock().await.take();
                match writer {
                    Some(writer) => {
                        let count = writer.record_count();
                        let identity = writer.finalize()?;
                        info!(records = count, identity = %&identity[..16], "archive finalized");
                        Ok(identity)
                    }
                    None => Ok(String::new()),
                }
            }
        }
    }
}

/// Handle one request; never fails the connection
///
/// `secure` marks requests arriving over the encrypted listener, where
/// script injection is suppressed.
pub async fn handle(
    state: Arc<ProxyState>,
    secure: bool,
    request: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let started = Instant::now();

    let (parts, body) = request.into_parts();

    let host = match request_host(&parts) {
        Some(host) => host,
        None => {
            warn!("request without host");
            return Ok(status_response(StatusCode::BAD_REQUEST));
        }
    };
    let path = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("failed to read request body: {e}");
            return Ok(status_response(StatusCode::BAD_REQUEST));
        }
    };

    let header_list: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let key = RequestKey::new(parts.method.as_str(), &host, &path, &header_list, &body_bytes);

    let response = match &state.engine {
        Engine::Replay(replay) => {
            replay_response(replay, &key, state.inject_script && !secure)
        }
        Engine::Record(record) => {
            record_response(record, &key, &parts, &host, &path, body_bytes).await
        }
    };

    let scheme = if secure { "https" } else { "http" };
    let url = format!("{scheme}://{host}{path}");
    state
        .stats
        .observe(&url, body_len(&response), started.elapsed());

    Ok(response)
}

fn body_len(response: &Response<Full<Bytes>>) -> u64 {
    use hyper::body::Body;
    response.body().size_hint().exact().unwrap_or(0)
}

fn replay_response(
    replay: &ReplayEngine,
    key: &RequestKey,
    inject_script: bool,
) -> Response<Full<Bytes>> {
    match replay.archive.lookup(key) {
        Some(record) => {
            debug!(
                key = %key.short_digest(),
                status = record.status,
                "replay hit"
            );
            build_client_response(&record, inject_script)
        }
        None => {
            // Strict replay: anything unrecorded is a hard 404
            info!(
                key = %key.short_digest(),
                method = %key.method,
                host = %key.host,
                path = %key.path,
                "replay miss"
            );
            status_response(StatusCode::NOT_FOUND)
        }
    }
}

async fn record_response(
    record: &RecordEngine,
    key: &RequestKey,
    parts: &hyper::http::request::Parts,
    host: &str,
    path: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let origin_ip = match record.resolver.lookup(host).await {
        Ok(ip) => ip,
        Err(e) => {
            warn!(%host, "origin resolution failed: {e}");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    let fetched = match fetch_origin(
        SocketAddr::new(origin_ip, record.origin_port),
        host,
        parts.method.clone(),
        path,
        &parts.headers,
        body,
        ORIGIN_READ_TIMEOUT,
    )
    .await
    {
        Ok(fetched) => fetched,
        Err(e) => {
            // Incomplete responses are never committed; the client sees
            // the failure instead
            warn!(%host, path, "origin fetch failed: {e}");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    let response_record = to_response_record(&fetched);

    // Commit before the client sees a single byte of the response
    let mut writer = record.writer.lock().await;
    let commit = match writer.as_mut() {
        Some(writer) => writer.append(key, &response_record),
        None => Err(ReplayError::Other("archive already finalized".to_string())),
    };
    drop(writer);

    if let Err(e) = commit {
        error!("archive commit failed, aborting session: {e}");
        let _ = record.abort.send(());
        return status_response(StatusCode::INTERNAL_SERVER_ERROR);
    }

    build_client_response(&response_record, false)
}

fn request_host(parts: &hyper::http::request::Parts) -> Option<String> {
    if let Some(host) = parts.uri.host() {
        return Some(host.to_string());
    }
    parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host).to_string())
}

/// Canonical stored form of an origin response: lowercase names, no
/// hop-by-hop headers, exact Content-Length (or preserved chunking)
fn to_response_record(fetched: &FetchedResponse) -> ResponseRecord {
    let mut headers: Vec<(String, String)> = Vec::with_capacity(fetched.headers.len() + 1);
    for (name, value) in &fetched.headers {
        let lower = name.to_lowercase();
        if lower == "content-length" {
            continue;
        }
        if is_hop_by_hop(&lower) {
            continue;
        }
        headers.push((lower, value.clone()));
    }
    if fetched.chunked {
        headers.push(("transfer-encoding".to_string(), "chunked".to_string()));
    } else {
        headers.push(("content-length".to_string(), fetched.body.len().to_string()));
    }

    ResponseRecord {
        status: fetched.status,
        reason: fetched.reason.clone(),
        headers,
        body: fetched.body.clone(),
        recorded_at_ms: epoch_millis(),
    }
}

/// Serve a stored response verbatim, optionally with the deterministic
/// script injected into HTML bodies
fn build_client_response(record: &ResponseRecord, inject_script: bool) -> Response<Full<Bytes>> {
    let content_type = record
        .headers
        .iter()
        .find(|(name, _)| name == "content-type")
        .map_or("", |(_, value)| value.as_str());
    let chunked = record.headers.iter().any(|(name, value)| {
        name == "transfer-encoding" && value.to_lowercase().contains("chunked")
    });

    let body: Vec<u8> = if inject_script && is_html(content_type) {
        inject(&record.body)
    } else {
        record.body.clone()
    };

    let status =
        StatusCode::from_u16(record.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &record.headers {
        if name == "content-length" {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !chunked {
        builder = builder.header(CONTENT_LENGTH, body.len());
    }

    builder
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|e| {
            error!("failed to build response from archive record: {e}");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        })
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_LENGTH, 0)
        .body(Full::new(Bytes::new()))
        .expect("static response is valid")
}
