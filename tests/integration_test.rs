//! End-to-end record and replay scenarios against live listeners

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use webreplay::archive::{epoch_millis, Archive, ArchiveWriter, ResponseRecord};
use webreplay::dns::RealDns;
use webreplay::fingerprint::RequestKey;
use webreplay::proxy::{HttpReplayServer, ProxyState, DETERMINISTIC_SCRIPT};

/// Headers the raw test client sends, in canonical key form
fn client_key(method: &str, host: &str, path: &str) -> RequestKey {
    let headers = vec![("host".to_string(), host.to_string())];
    RequestKey::new(method, host, path, &headers, b"")
}

/// Issue one HTTP/1.1 request over a fresh connection
async fn http_get(addr: SocketAddr, host: &str, path: &str) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .expect("status line")
        .parse()
        .unwrap();
    let body_start = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map_or(raw.len(), |i| i + 4);
    (status, raw[body_start..].to_vec())
}

/// Origin that serves "one" then "two" for /a, an HTML page for /page,
/// and "hi" for everything else
async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let hits = Arc::clone(&hits);
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let hits = Arc::clone(&hits);
                    async move {
                        let (content_type, body) = match request.uri().path() {
                            "/a" => {
                                let n = hits.fetch_add(1, Ordering::SeqCst);
                                let body = if n == 0 { "one" } else { "two" };
                                ("text/plain", body.to_string())
                            }
                            "/page" => (
                                "text/html",
                                "<html><head><title>t</title></head>\
                                 <body><script>var x=1;</script></body></html>"
                                    .to_string(),
                            ),
                            _ => ("text/plain", "hi".to_string()),
                        };
                        let response = Response::builder()
                            .status(200)
                            .header("content-type", content_type)
                            .header("content-length", body.len())
                            .body(Full::new(Bytes::from(body)))
                            .unwrap();
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
}

async fn spawn_replay_server(state: Arc<ProxyState>) -> RunningServer {
    let (shutdown, _) = broadcast::channel(1);
    let server = HttpReplayServer::bind("127.0.0.1:0".parse().unwrap(), state, false)
        .await
        .unwrap();
    let addr = server.local_addr();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(rx).await;
    });
    RunningServer { addr, shutdown }
}

#[tokio::test]
async fn test_record_then_replay_roundtrip() {
    let origin = spawn_origin().await;
    let dir = TempDir::new().unwrap();
    let archive_path = dir.path().join("session.wpr");

    // record: two fetches of /a capture "one" then "two", plus /
    let (abort, _) = broadcast::channel(1);
    let writer = ArchiveWriter::create(&archive_path).unwrap();
    let state = Arc::new(ProxyState::record(
        writer,
        RealDns::Fixed(origin.ip()),
        origin.port(),
        abort,
    ));
    let recorder = spawn_replay_server(Arc::clone(&state)).await;

    let (status, body) = http_get(recorder.addr, "example.test", "/").await;
    assert_eq!((status, body.as_slice()), (200, b"hi".as_slice()));
    let (_, body) = http_get(recorder.addr, "example.test", "/a").await;
    assert_eq!(body, b"one");
    let (_, body) = http_get(recorder.addr, "example.test", "/a").await;
    assert_eq!(body, b"two");

    recorder.shutdown.send(()).ok();
    let identity = state.finalize().await.unwrap();
    assert_eq!(identity.len(), 64);

    // replay: the same sequence comes back byte-identical, and the
    // duplicate key cursors through its recordings then saturates
    let archive = Archive::load(&archive_path).unwrap();
    assert_eq!(archive.record_count(), 3);
    let state = Arc::new(ProxyState::replay(archive, false));
    let replayer = spawn_replay_server(Arc::clone(&state)).await;

    let (status, body) = http_get(replayer.addr, "example.test", "/").await;
    assert_eq!((status, body.as_slice()), (200, b"hi".as_slice()));
    let (_, body) = http_get(replayer.addr, "example.test", "/").await;
    assert_eq!(body, b"hi");

    let (_, body) = http_get(replayer.addr, "example.test", "/a").await;
    assert_eq!(body, b"one");
    let (_, body) = http_get(replayer.addr, "example.test", "/a").await;
    assert_eq!(body, b"two");
    let (_, body) = http_get(replayer.addr, "example.test", "/a").await;
    assert_eq!(body, b"two");

    // strict replay: nothing recorded for /missing
    let (status, body) = http_get(replayer.addr, "example.test", "/missing").await;
    assert_eq!(status, 404);
    assert!(body.is_empty());

    replayer.shutdown.send(()).ok();
    assert_eq!(state.hit_miss(), (5, 1));
}

#[tokio::test]
async fn test_replay_strict_miss_on_empty_archive() {
    let dir = TempDir::new().unwrap();
    let archive_path = dir.path().join("empty.wpr");
    ArchiveWriter::create(&archive_path)
        .unwrap()
        .finalize()
        .unwrap();

    let state = Arc::new(ProxyState::replay(
        Archive::load(&archive_path).unwrap(),
        false,
    ));
    let server = spawn_replay_server(state).await;

    let (status, body) = http_get(server.addr, "example.test", "/anything").await;
    assert_eq!(status, 404);
    assert!(body.is_empty());
    server.shutdown.send(()).ok();
}

#[tokio::test]
async fn test_replay_injects_deterministic_script() {
    let dir = TempDir::new().unwrap();
    let archive_path = dir.path().join("html.wpr");

    let html = b"<html><head><title>t</title></head><body><script>var x=1;</script></body></html>";
    let mut writer = ArchiveWriter::create(&archive_path).unwrap();
    let key = client_key("GET", "example.test", "/page");
    writer
        .append(
            &key,
            &ResponseRecord {
                status: 200,
                reason: "OK".to_string(),
                headers: vec![
                    ("content-type".to_string(), "text/html".to_string()),
                    ("content-length".to_string(), html.len().to_string()),
                ],
                body: html.to_vec(),
                recorded_at_ms: epoch_millis(),
            },
        )
        .unwrap();
    writer.finalize().unwrap();

    let state = Arc::new(ProxyState::replay(
        Archive::load(&archive_path).unwrap(),
        true,
    ));
    let server = spawn_replay_server(state).await;

    let (status, body) = http_get(server.addr, "example.test", "/page").await;
    assert_eq!(status, 200);

    let text = String::from_utf8(body.clone()).unwrap();
    // injected exactly once, ahead of the page's own script
    assert_eq!(text.matches("Math.random=").count(), 1);
    let ours = text.find(DETERMINISTIC_SCRIPT).unwrap();
    let theirs = text.find("var x=1;").unwrap();
    assert!(ours < theirs);
    assert_eq!(body.len(), html.len() + DETERMINISTIC_SCRIPT.len());

    server.shutdown.send(()).ok();
}

#[tokio::test]
async fn test_replay_determinism_across_runs() {
    let origin = spawn_origin().await;
    let dir = TempDir::new().unwrap();
    let archive_path = dir.path().join("det.wpr");

    let (abort, _) = broadcast::channel(1);
    let state = Arc::new(ProxyState::record(
        ArchiveWriter::create(&archive_path).unwrap(),
        RealDns::Fixed(origin.ip()),
        origin.port(),
        abort,
    ));
    let recorder = spawn_replay_server(Arc::clone(&state)).await;
    let _ = http_get(recorder.addr, "example.test", "/").await;
    recorder.shutdown.send(()).ok();
    state.finalize().await.unwrap();

    // two independent replay runs observe identical bytes
    let mut observed = Vec::new();
    for _ in 0..2 {
        let state = Arc::new(ProxyState::replay(
            Archive::load(&archive_path).unwrap(),
            false,
        ));
        let server = spawn_replay_server(state).await;
        observed.push(http_get(server.addr, "example.test", "/").await);
        server.shutdown.send(()).ok();
    }
    assert_eq!(observed[0], observed[1]);
}
