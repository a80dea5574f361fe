//! Unit tests for the dispatch table and HTTP status classification.

use std::sync::Arc;
use std::time::Duration;

use offline_queue::dispatch::http::{classify_status, HttpHandler};
use offline_queue::dispatch::{DispatchTable, Handler, HandlerError, HandlerFuture};
use offline_queue::AppError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

struct Echo;

impl Handler for Echo {
    fn execute<'a>(&'a self, data: &'a [u8]) -> HandlerFuture<'a> {
        Box::pin(async move {
            if data.is_empty() {
                Err(HandlerError::Rejected("empty payload".into()))
            } else {
                Ok(())
            }
        })
    }
}

#[tokio::test]
async fn registered_handler_resolves_and_executes() {
    let mut table = DispatchTable::new();
    table.register("timelogs", Arc::new(Echo)).expect("register");

    let handler = table.resolve("timelogs").expect("resolve");
    assert_eq!(handler.execute(b"{}").await, Ok(()));
    assert_eq!(
        handler.execute(b"").await,
        Err(HandlerError::Rejected("empty payload".into()))
    );
}

#[test]
fn unknown_queue_is_an_error() {
    let table = DispatchTable::new();
    let err = table.resolve("screenshots").err().expect("unknown queue");
    assert!(matches!(err, AppError::UnknownQueue(ref q) if q == "screenshots"));
    assert_eq!(err.to_string(), "unknown queue: screenshots");
}

#[test]
fn duplicate_and_empty_registrations_rejected() {
    let mut table = DispatchTable::new();
    table.register("timelogs", Arc::new(Echo)).expect("register");
    assert!(matches!(
        table.register("timelogs", Arc::new(Echo)),
        Err(AppError::Config(_))
    ));
    assert!(matches!(
        table.register("  ", Arc::new(Echo)),
        Err(AppError::Config(_))
    ));
    assert_eq!(table.queues(), vec!["timelogs"]);
}

#[test]
fn queues_are_listed_sorted() {
    let mut table = DispatchTable::new();
    assert!(table.queues().is_empty());
    table.register("timelogs", Arc::new(Echo)).expect("register");
    table.register("activity", Arc::new(Echo)).expect("register");
    table.register("screenshots", Arc::new(Echo)).expect("register");
    assert_eq!(table.queues(), vec!["activity", "screenshots", "timelogs"]);
}

#[test]
fn http_statuses_classified() {
    assert_eq!(classify_status(200), None);
    assert_eq!(classify_status(204), None);

    for transient in [408, 429, 500, 502, 503, 504] {
        assert!(
            matches!(classify_status(transient), Some(HandlerError::Transport(_))),
            "{transient} should be retryable"
        );
    }
    for permanent in [400, 401, 403, 404, 409, 422] {
        assert!(
            matches!(classify_status(permanent), Some(HandlerError::Rejected(_))),
            "{permanent} should be rejected"
        );
    }
}

#[test]
fn handler_error_display_has_class_prefix() {
    let transport = HandlerError::Transport("connection refused".into());
    let rejected = HandlerError::Rejected("http status 400".into());
    assert_eq!(transport.to_string(), "transport: connection refused");
    assert_eq!(rejected.to_string(), "rejected: http status 400");
    assert!(transport.is_transport());
    assert!(!rejected.is_transport());
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_error() {
    let handler = HttpHandler::new(
        reqwest::Client::new(),
        "http://127.0.0.1:9/unreachable",
        None,
        Duration::from_millis(500),
    );
    assert_eq!(handler.url(), "http://127.0.0.1:9/unreachable");
    let result = handler.execute(b"{}").await;
    assert!(matches!(result, Err(HandlerError::Transport(_))));
}

// ── HttpHandler against a local endpoint ─────────────

/// Serve one request, answer it with `status` and hand back the raw request.
async fn serve_once(status: u16) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let request = read_request(&mut socket).await;
        let response =
            format!("HTTP/1.1 {status} Test\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        socket.write_all(response.as_bytes()).await.expect("respond");
        socket.shutdown().await.ok();
        request
    });
    (format!("http://{addr}/api/timesheet/time-log"), server)
}

/// Read the request head plus a `content-length` body.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let read = socket.read(&mut chunk).await.expect("read request");
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= head_end + 4 + body_len {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn accepted_post_carries_payload_and_token() {
    let (url, server) = serve_once(201).await;
    let handler = HttpHandler::new(
        reqwest::Client::new(),
        url,
        Some("secret-token".into()),
        Duration::from_secs(5),
    );

    assert_eq!(handler.execute(br#"{"minutes":30}"#).await, Ok(()));

    let request = server.await.expect("server task");
    let lowered = request.to_ascii_lowercase();
    assert!(request.starts_with("POST /api/timesheet/time-log "));
    assert!(lowered.contains("authorization: bearer secret-token"));
    assert!(lowered.contains("content-type: application/json"));
    assert!(request.ends_with(r#"{"minutes":30}"#));
}

#[tokio::test]
async fn client_error_is_a_rejection() {
    let (url, server) = serve_once(422).await;
    let handler = HttpHandler::new(reqwest::Client::new(), url, None, Duration::from_secs(5));

    let result = handler.execute(b"{}").await;
    assert!(matches!(result, Err(HandlerError::Rejected(_))), "{result:?}");

    let request = server.await.expect("server task");
    assert!(!request.to_ascii_lowercase().contains("authorization:"));
}

#[tokio::test]
async fn server_error_is_retryable() {
    let (url, server) = serve_once(503).await;
    let handler = HttpHandler::new(reqwest::Client::new(), url, None, Duration::from_secs(5));

    let result = handler.execute(b"{}").await;
    assert!(matches!(result, Err(HandlerError::Transport(_))), "{result:?}");
    server.await.expect("server task");
}
