//! Streaming call executor against raw TCP mock servers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use gust::dispatch::stream::{CallState, CancelHandle, StreamExecutor, StreamHandler, StreamStats};
use gust::dispatch::{PartialResult, RequestBody, RequestOptions};
use gust::error::GustError;
use gust::telemetry::TelemetryContext;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Helper: bind a TCP listener on localhost and return (listener, port).
async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Helper: read one HTTP request and return its body.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return String::new();
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= pos + 4 + len {
                return String::from_utf8_lossy(&buf[pos + 4..pos + 4 + len]).to_string();
            }
        }
    }
}

/// Helper: format an SSE data event from a content string.
fn sse_chunk(content: &str) -> String {
    format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n")
}

const SSE_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Connection: close\r\n\r\n";

const NDJSON_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: application/x-ndjson\r\n\
    Connection: close\r\n\r\n";

const JSON_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: application/json\r\n\
    Connection: close\r\n\r\n";

const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

/// Helper: serve one request with `parts`, optionally stalling afterwards.
fn serve(listener: TcpListener, parts: Vec<Vec<u8>>, stall: Option<Duration>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let body = read_request(&mut socket).await;
        for part in parts {
            socket.write_all(&part).await.unwrap();
            socket.flush().await.unwrap();
        }
        if let Some(d) = stall {
            tokio::time::sleep(d).await;
        }
        body
    })
}

fn options(port: u16) -> RequestOptions {
    RequestOptions {
        hostname: format!("127.0.0.1:{port}"),
        path: "/v1/chat/completions".to_string(),
        protocol: "http".to_string(),
        method: "POST".to_string(),
        headers: Default::default(),
        provider: "mock".to_string(),
    }
}

fn body(stream: bool) -> RequestBody {
    RequestBody {
        model: Some("test-model".to_string()),
        prompt: Some("hi".to_string()),
        stream,
        ..RequestBody::default()
    }
}

#[derive(Default)]
struct Recorder {
    starts: usize,
    data: Vec<PartialResult>,
    ends: Vec<(Option<PartialResult>, StreamStats)>,
    errors: Vec<GustError>,
    /// Cancel from inside `on_data` once this many chunks arrived.
    cancel_after: Option<usize>,
    handle: Option<CancelHandle>,
    shared_handle: Arc<Mutex<Option<CancelHandle>>>,
}

impl StreamHandler for Recorder {
    fn on_start(&mut self, handle: CancelHandle) {
        self.starts += 1;
        *self.shared_handle.lock().unwrap() = Some(handle.clone());
        self.handle = Some(handle);
    }

    fn on_data(&mut self, partial: PartialResult) {
        self.data.push(partial);
        if self.cancel_after == Some(self.data.len()) {
            self.handle.as_ref().unwrap().cancel();
        }
    }

    fn on_end(&mut self, final_result: Option<PartialResult>, stats: &StreamStats) {
        self.ends.push((final_result, stats.clone()));
    }

    fn on_error(&mut self, error: GustError) {
        self.errors.push(error);
    }
}

impl Recorder {
    fn text(&self) -> String {
        self.data.iter().map(|p| p.content.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Complete responses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sse_stream_delivers_chunks_in_order() {
    let (listener, port) = mock_listener().await;
    let server = serve(
        listener,
        vec![
            SSE_HEADERS.to_vec(),
            sse_chunk("Hello ").into_bytes(),
            sse_chunk("world!").into_bytes(),
            SSE_DONE.to_vec(),
        ],
        None,
    );

    let mut rec = Recorder::default();
    let state = StreamExecutor::new()
        .execute(&options(port), &body(true), &mut rec, None)
        .await;

    assert_eq!(state, CallState::Completed);
    assert_eq!(rec.starts, 1);
    assert_eq!(rec.text(), "Hello world!");
    assert_eq!(rec.ends.len(), 1);
    assert!(rec.ends[0].0.is_none());
    assert_eq!(rec.ends[0].1.chunks, 2);
    assert!(rec.errors.is_empty());

    let sent: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["model"], "test-model");
}

#[tokio::test]
async fn ndjson_stream_ends_on_done_record() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![
            NDJSON_HEADERS.to_vec(),
            b"{\"message\":{\"content\":\"Hel\"},\"done\":false}\n".to_vec(),
            // Record split across writes.
            b"{\"message\":{\"content\":\"lo\"},".to_vec(),
            b"\"done\":false}\n".to_vec(),
            b"{\"message\":{\"content\":\"\"},\"done\":true,\"prompt_eval_count\":5,\"eval_count\":2}\n"
                .to_vec(),
        ],
        // Server keeps the socket open; the done flag alone must end the call.
        Some(Duration::from_secs(10)),
    );

    let mut rec = Recorder::default();
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        StreamExecutor::new().execute(&options(port), &body(true), &mut rec, None),
    )
    .await
    .expect("done record should end the call");

    assert_eq!(state, CallState::Completed);
    assert_eq!(rec.text(), "Hello");
    let stats = &rec.ends[0].1;
    assert_eq!(stats.usage.unwrap().prompt_tokens, 5);
    assert_eq!(stats.usage.unwrap().completion_tokens, 2);
}

#[tokio::test]
async fn malformed_chunk_is_skipped() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![
            SSE_HEADERS.to_vec(),
            sse_chunk("a").into_bytes(),
            b"data: {oops\n\n".to_vec(),
            b": keep-alive\n\n".to_vec(),
            sse_chunk("b").into_bytes(),
            SSE_DONE.to_vec(),
        ],
        None,
    );

    let mut rec = Recorder::default();
    let state = StreamExecutor::new()
        .execute(&options(port), &body(true), &mut rec, None)
        .await;

    assert_eq!(state, CallState::Completed);
    assert_eq!(rec.text(), "ab");
    assert_eq!(rec.ends[0].1.skipped, 1);
}

#[tokio::test]
async fn non_streaming_body_delivered_as_final_result() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![
            JSON_HEADERS.to_vec(),
            br#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"read_file","arguments":{"path":"a.rs"}}}]},"done":true}"#.to_vec(),
        ],
        None,
    );

    let mut rec = Recorder::default();
    let state = StreamExecutor::new()
        .execute(&options(port), &body(false), &mut rec, None)
        .await;

    assert_eq!(state, CallState::Completed);
    assert!(rec.data.is_empty());
    let final_result = rec.ends[0].0.as_ref().expect("final result");
    assert_eq!(final_result.tool_calls.len(), 1);
    assert_eq!(final_result.tool_calls[0].name.as_deref(), Some("read_file"));
}

// ---------------------------------------------------------------------------
// Failures: exactly one on_error, never followed by on_end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_error_maps_to_upstream() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nboom".to_vec()],
        None,
    );

    let mut rec = Recorder::default();
    let state = StreamExecutor::new()
        .execute(&options(port), &body(true), &mut rec, None)
        .await;

    assert_eq!(state, CallState::Errored);
    assert!(rec.ends.is_empty());
    assert_eq!(rec.errors.len(), 1);
    match &rec.errors[0] {
        GustError::Upstream {
            status, message, ..
        } => {
            assert_eq!(*status, Some(500));
            assert!(message.contains("boom"));
        }
        other => panic!("expected Upstream, got {other:?}"),
    }
}

async fn error_for_status(status_line: &str) -> Vec<GustError> {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![format!("HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").into_bytes()],
        None,
    );
    let mut rec = Recorder::default();
    StreamExecutor::new()
        .execute(&options(port), &body(true), &mut rec, None)
        .await;
    assert!(rec.ends.is_empty(), "{status_line}");
    rec.errors
}

#[tokio::test]
async fn rate_limit_and_auth_statuses() {
    let errors = error_for_status("429 Too Many Requests").await;
    assert!(matches!(errors[..], [GustError::RateLimited { .. }]), "{errors:?}");

    let errors = error_for_status("401 Unauthorized").await;
    assert!(matches!(errors[..], [GustError::AuthFailed { .. }]), "{errors:?}");

    let errors = error_for_status("403 Forbidden").await;
    assert!(matches!(errors[..], [GustError::AuthFailed { .. }]), "{errors:?}");
}

#[tokio::test]
async fn connection_refused_is_request_error() {
    let (listener, port) = mock_listener().await;
    drop(listener);

    let mut rec = Recorder::default();
    let state = StreamExecutor::new()
        .execute(&options(port), &body(true), &mut rec, None)
        .await;

    assert_eq!(state, CallState::Errored);
    assert!(matches!(rec.errors[..], [GustError::Request(_)]));
    assert!(rec.ends.is_empty());
}

#[tokio::test]
async fn stalled_stream_times_out() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![SSE_HEADERS.to_vec(), sse_chunk("partial").into_bytes()],
        Some(Duration::from_secs(10)),
    );

    let mut rec = Recorder::default();
    let state = StreamExecutor::new()
        .with_stall_timeout(Duration::from_millis(300))
        .execute(&options(port), &body(true), &mut rec, None)
        .await;

    assert_eq!(state, CallState::Errored);
    assert_eq!(rec.text(), "partial");
    assert!(matches!(rec.errors[..], [GustError::Timeout(300)]));
    assert!(rec.ends.is_empty());
}

#[tokio::test]
async fn unterminated_stream_line_is_capped() {
    let (listener, port) = mock_listener().await;
    // 3 MiB without a newline, then the connection stays open.
    let _server = serve(
        listener,
        vec![NDJSON_HEADERS.to_vec(), vec![b'x'; 3 * 1024 * 1024]],
        Some(Duration::from_secs(10)),
    );

    let mut rec = Recorder::default();
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        StreamExecutor::new().execute(&options(port), &body(true), &mut rec, None),
    )
    .await
    .expect("oversized line must fail fast");

    assert_eq!(state, CallState::Errored);
    assert!(rec.ends.is_empty());
    assert!(matches!(rec.errors.as_slice(), [GustError::SchemaParse(_)]));
}

#[tokio::test]
async fn oversized_whole_body_is_rejected() {
    let (listener, port) = mock_listener().await;
    // No Content-Length: the cap applies while reading.
    let _server = serve(
        listener,
        vec![JSON_HEADERS.to_vec(), vec![b' '; 3 * 1024 * 1024]],
        Some(Duration::from_secs(10)),
    );

    let mut rec = Recorder::default();
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        StreamExecutor::new().execute(&options(port), &body(false), &mut rec, None),
    )
    .await
    .expect("oversized body must fail before the connection closes");

    assert_eq!(state, CallState::Errored);
    assert!(matches!(rec.errors.as_slice(), [GustError::SchemaParse(msg)] if msg.contains("too large")));
}

#[tokio::test]
async fn declared_oversized_body_is_rejected_before_reading() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 10000000\r\n\r\n{".to_vec()],
        Some(Duration::from_secs(10)),
    );

    let mut rec = Recorder::default();
    let state = StreamExecutor::new()
        .execute(&options(port), &body(false), &mut rec, None)
        .await;

    assert_eq!(state, CallState::Errored);
    assert!(matches!(rec.errors.as_slice(), [GustError::SchemaParse(msg)] if msg.contains("10000000")));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_inside_on_data_stops_delivery() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![
            SSE_HEADERS.to_vec(),
            format!("{}{}", sse_chunk("one"), sse_chunk("two")).into_bytes(),
        ],
        Some(Duration::from_secs(10)),
    );

    let mut rec = Recorder {
        cancel_after: Some(1),
        ..Recorder::default()
    };
    let state = StreamExecutor::new()
        .execute(&options(port), &body(true), &mut rec, None)
        .await;

    assert_eq!(state, CallState::Cancelled);
    assert_eq!(rec.text(), "one");
    assert_eq!(rec.ends.len(), 1);
    assert!(rec.ends[0].0.is_none());
    assert!(rec.errors.is_empty());
}

#[tokio::test]
async fn external_cancel_ends_waiting_call() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![SSE_HEADERS.to_vec(), sse_chunk("first").into_bytes()],
        Some(Duration::from_secs(10)),
    );

    let shared = Arc::new(Mutex::new(None::<CancelHandle>));
    let canceller = {
        let shared = shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            shared.lock().unwrap().as_ref().unwrap().cancel();
        })
    };

    let mut rec = Recorder {
        shared_handle: shared,
        ..Recorder::default()
    };
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        StreamExecutor::new().execute(&options(port), &body(true), &mut rec, None),
    )
    .await
    .expect("cancel should end the call promptly");
    canceller.await.unwrap();

    assert_eq!(state, CallState::Cancelled);
    assert_eq!(rec.text(), "first");
    assert_eq!(rec.ends.len(), 1);
    assert!(rec.errors.is_empty());
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn telemetry_posted_after_completion() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![
            SSE_HEADERS.to_vec(),
            sse_chunk("  answer").into_bytes(),
            SSE_DONE.to_vec(),
        ],
        None,
    );
    let (telemetry_listener, telemetry_port) = mock_listener().await;
    let telemetry_server = serve(
        telemetry_listener,
        vec![b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()],
        None,
    );

    let ctx = TelemetryContext {
        url: format!("http://127.0.0.1:{telemetry_port}/ask"),
        username: "dev".to_string(),
        project: Some("proj".to_string()),
        uuid: "u-1".to_string(),
        source: "gust".to_string(),
        model: "test-model".to_string(),
        action: "ask".to_string(),
    };
    let mut rec = Recorder::default();
    StreamExecutor::new()
        .execute(&options(port), &body(true), &mut rec, Some(ctx))
        .await;

    let report = tokio::time::timeout(Duration::from_secs(5), telemetry_server)
        .await
        .expect("telemetry should arrive")
        .unwrap();
    let report: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(report["response"], "answer");
    assert_eq!(report["uuid"], "u-1");
    assert_eq!(report["action"], "ask");
    assert_eq!(report["project"], "proj");
}

#[tokio::test]
async fn no_telemetry_for_failed_call() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()],
        None,
    );
    let (telemetry_listener, telemetry_port) = mock_listener().await;

    let ctx = TelemetryContext {
        url: format!("http://127.0.0.1:{telemetry_port}/ask"),
        username: "dev".to_string(),
        project: None,
        uuid: "u-2".to_string(),
        source: "gust".to_string(),
        model: "m".to_string(),
        action: "ask".to_string(),
    };
    let mut rec = Recorder::default();
    StreamExecutor::new()
        .execute(&options(port), &body(true), &mut rec, Some(ctx))
        .await;

    let accepted = tokio::time::timeout(Duration::from_millis(300), telemetry_listener.accept()).await;
    assert!(accepted.is_err(), "failed calls must not report telemetry");
}

fn telemetry_ctx(port: u16) -> TelemetryContext {
    TelemetryContext {
        url: format!("http://127.0.0.1:{port}/ask"),
        username: "dev".to_string(),
        project: None,
        uuid: "u-3".to_string(),
        source: "gust".to_string(),
        model: "test-model".to_string(),
        action: "ask".to_string(),
    }
}

#[tokio::test]
async fn rejected_telemetry_does_not_affect_completion() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![SSE_HEADERS.to_vec(), sse_chunk("answer").into_bytes(), SSE_DONE.to_vec()],
        None,
    );
    let (telemetry_listener, telemetry_port) = mock_listener().await;
    let telemetry_server = serve(
        telemetry_listener,
        vec![b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nboom".to_vec()],
        None,
    );

    let mut rec = Recorder::default();
    let state = StreamExecutor::new()
        .execute(&options(port), &body(true), &mut rec, Some(telemetry_ctx(telemetry_port)))
        .await;

    assert_eq!(state, CallState::Completed);
    assert_eq!(rec.ends.len(), 1);
    assert!(rec.errors.is_empty());
    assert_eq!(rec.text(), "answer");

    // The report was attempted and refused; the call never saw it.
    let report = tokio::time::timeout(Duration::from_secs(5), telemetry_server)
        .await
        .expect("telemetry should be attempted")
        .unwrap();
    assert!(report.contains("\"uuid\":\"u-3\""));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rec.ends.len(), 1);
    assert!(rec.errors.is_empty());
}

#[tokio::test]
async fn unreachable_telemetry_does_not_affect_completion() {
    let (listener, port) = mock_listener().await;
    let _server = serve(
        listener,
        vec![NDJSON_HEADERS.to_vec(), b"{\"response\":\"done\",\"done\":true}\n".to_vec()],
        None,
    );
    // Bind then drop: nothing listens on this port.
    let closed_port = mock_listener().await.1;

    let mut rec = Recorder::default();
    let state = StreamExecutor::new()
        .execute(&options(port), &body(true), &mut rec, Some(telemetry_ctx(closed_port)))
        .await;

    assert_eq!(state, CallState::Completed);
    assert_eq!(rec.starts, 1);
    assert_eq!(rec.ends.len(), 1);
    assert!(rec.errors.is_empty());
    assert_eq!(rec.text(), "done");
}
