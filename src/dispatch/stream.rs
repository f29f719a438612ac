//! Lifecycle of one streaming HTTP call.
//!
//! `idle → started → streaming → {completed | errored | cancelled}`. Each call
//! gets a fresh state machine; terminal states are absorbing. Callbacks for a
//! call run sequentially on the executing task in transport order.

use std::time::{Duration, Instant};

use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::StreamExt;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::dispatch::decode::{Decoded, LineBuffer, decode_record, strip_sse_prefix};
use crate::dispatch::{PartialResult, RequestBody, RequestOptions, Usage};
use crate::error::GustError;
use crate::telemetry::{self, TelemetryContext};

/// Error bodies are read up to this many bytes.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Non-streaming bodies and single stream lines larger than this are rejected.
const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Handle that aborts an in-flight call. Cloneable; cancelling twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Started,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }

    /// Move to `next` if the transition is legal. Returns false (and stays
    /// put) otherwise.
    pub fn advance(&mut self, next: CallState) -> bool {
        use CallState::*;
        let legal = matches!(
            (*self, next),
            (Idle, Started)
                | (Started, Streaming)
                | (Started | Streaming, Completed | Errored | Cancelled)
        );
        if legal {
            *self = next;
        }
        legal
    }
}

/// Counters delivered with the terminal `on_end`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    /// Records delivered through `on_data`.
    pub chunks: usize,
    /// Malformed records skipped.
    pub skipped: usize,
    pub usage: Option<Usage>,
    pub elapsed_ms: u64,
}

/// Receiver of one call's lifecycle events.
///
/// Exactly one of `on_end` / `on_error` is invoked per call. After the
/// cancel handle fires, `on_data` is never invoked again.
pub trait StreamHandler: Send {
    fn on_start(&mut self, handle: CancelHandle);
    fn on_data(&mut self, partial: PartialResult);
    fn on_end(&mut self, final_result: Option<PartialResult>, stats: &StreamStats);
    fn on_error(&mut self, error: GustError);
}

enum Outcome {
    Completed(Option<PartialResult>),
    Cancelled,
    Failed(GustError),
}

enum Control {
    Continue,
    Finished,
    Cancelled,
    Fail(GustError),
}

/// Per-call bookkeeping threaded through the decode loop.
struct CallRun {
    stats: StreamStats,
    /// Concatenated content, kept only for the telemetry report.
    telemetry_text: String,
    state: CallState,
}

impl CallRun {
    fn absorb<H: StreamHandler + ?Sized>(
        &mut self,
        payload: &str,
        handler: &mut H,
        handle: &CancelHandle,
    ) -> Control {
        if handle.is_cancelled() {
            return Control::Cancelled;
        }
        match decode_record(payload) {
            Ok(Decoded::Skip) => Control::Continue,
            Ok(Decoded::Done) => Control::Finished,
            Ok(Decoded::Record(record)) => {
                let done = record.done;
                if record.usage.is_some() {
                    self.stats.usage = record.usage;
                }
                self.telemetry_text.push_str(&record.content);
                self.stats.chunks += 1;
                handler.on_data(record);
                if handle.is_cancelled() {
                    Control::Cancelled
                } else if done {
                    Control::Finished
                } else {
                    Control::Continue
                }
            }
            Err(GustError::SchemaParse(msg)) => {
                self.stats.skipped += 1;
                tracing::warn!(payload_len = payload.len(), "skipping malformed chunk: {msg}");
                Control::Continue
            }
            Err(e) => Control::Fail(e),
        }
    }
}

#[derive(Clone)]
pub struct StreamExecutor {
    client: Client,
    stall_timeout: Duration,
}

impl Default for StreamExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamExecutor {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("falling back to default HTTP client: {e}");
                Client::new()
            });

        Self {
            client,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    /// Maximum silence between two chunks before the call errors out.
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    fn stalled(&self) -> GustError {
        GustError::Timeout(self.stall_timeout.as_millis() as u64)
    }

    /// Run one call to completion, reporting through `handler`. Returns the
    /// terminal state.
    pub async fn execute<H: StreamHandler + ?Sized>(
        &self,
        options: &RequestOptions,
        body: &RequestBody,
        handler: &mut H,
        telemetry: Option<TelemetryContext>,
    ) -> CallState {
        let start = Instant::now();
        let handle = CancelHandle::new();
        let mut run = CallRun {
            stats: StreamStats::default(),
            telemetry_text: String::new(),
            state: CallState::Idle,
        };

        run.state.advance(CallState::Started);
        handler.on_start(handle.clone());

        let outcome = if handle.is_cancelled() {
            Outcome::Cancelled
        } else {
            self.run(options, body, handler, &handle, &mut run).await
        };

        run.stats.elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Completed(final_result) => {
                run.state.advance(CallState::Completed);
                tracing::info!(
                    provider = %options.provider,
                    chunks = run.stats.chunks,
                    skipped = run.stats.skipped,
                    elapsed_ms = run.stats.elapsed_ms,
                    "stream completed"
                );
                if let Some(ref record) = final_result {
                    run.telemetry_text.push_str(&record.content);
                }
                handler.on_end(final_result, &run.stats);
                if let Some(ctx) = telemetry {
                    let text = run.telemetry_text.trim_start();
                    if !text.is_empty() {
                        telemetry::spawn_report(self.client.clone(), ctx.url.clone(), ctx.report(text));
                    }
                }
            }
            Outcome::Cancelled => {
                run.state.advance(CallState::Cancelled);
                tracing::info!(provider = %options.provider, chunks = run.stats.chunks, "stream cancelled");
                handler.on_end(None, &run.stats);
            }
            Outcome::Failed(e) => {
                run.state.advance(CallState::Errored);
                tracing::warn!(provider = %options.provider, "stream failed: {e}");
                handler.on_error(e);
            }
        }

        run.state
    }

    async fn run<H: StreamHandler + ?Sized>(
        &self,
        options: &RequestOptions,
        body: &RequestBody,
        handler: &mut H,
        handle: &CancelHandle,
        run: &mut CallRun,
    ) -> Outcome {
        let url = options.url();
        let method =
            reqwest::Method::from_bytes(options.method.as_bytes()).unwrap_or(reqwest::Method::POST);
        let mut request = self.client.request(method, &url).json(body);
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }

        tracing::debug!(provider = %options.provider, %url, stream = body.stream, "sending request");

        let response = tokio::select! {
            biased;
            _ = handle.token().cancelled() => return Outcome::Cancelled,
            r = request.send() => match r {
                Ok(r) => r,
                Err(e) => return Outcome::Failed(GustError::Request(e)),
            },
        };

        let response = match check_status(&options.provider, response).await {
            Ok(r) => r,
            Err(e) => return Outcome::Failed(e),
        };
        run.state.advance(CallState::Streaming);

        if !body.stream {
            return self.read_whole(response, handle, run).await;
        }

        let event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));

        if event_stream {
            self.read_events(response, handler, handle, run).await
        } else {
            self.read_lines(response, handler, handle, run).await
        }
    }

    /// `stream: false` responses carry one JSON document, handed to `on_end`.
    async fn read_whole(
        &self,
        response: reqwest::Response,
        handle: &CancelHandle,
        run: &mut CallRun,
    ) -> Outcome {
        if let Some(len) = response.content_length()
            && len > MAX_RESPONSE_BYTES as u64
        {
            return Outcome::Failed(too_large(len));
        }

        let mut chunks = std::pin::pin!(response.bytes_stream());
        let mut bytes = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = handle.token().cancelled() => return Outcome::Cancelled,
                n = tokio::time::timeout(self.stall_timeout, chunks.next()) => n,
            };
            match next {
                Err(_) => return Outcome::Failed(self.stalled()),
                Ok(Some(Err(e))) => return Outcome::Failed(GustError::Request(e)),
                Ok(Some(Ok(chunk))) => {
                    let total = bytes.len() + chunk.len();
                    if total > MAX_RESPONSE_BYTES {
                        return Outcome::Failed(too_large(total as u64));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                Ok(None) => break,
            }
        }

        let text = String::from_utf8_lossy(&bytes);
        match decode_record(&text) {
            Ok(Decoded::Record(record)) => {
                run.stats.usage = record.usage;
                Outcome::Completed(Some(record))
            }
            Ok(Decoded::Done | Decoded::Skip) => Outcome::Completed(None),
            Err(e) => Outcome::Failed(e),
        }
    }

    async fn read_events<H: StreamHandler + ?Sized>(
        &self,
        response: reqwest::Response,
        handler: &mut H,
        handle: &CancelHandle,
        run: &mut CallRun,
    ) -> Outcome {
        let mut events = std::pin::pin!(response.bytes_stream().eventsource());
        loop {
            let next = tokio::select! {
                biased;
                _ = handle.token().cancelled() => return Outcome::Cancelled,
                n = tokio::time::timeout(self.stall_timeout, events.next()) => n,
            };
            let event = match next {
                Err(_) => return Outcome::Failed(self.stalled()),
                Ok(None) => return Outcome::Completed(None),
                Ok(Some(Err(EventStreamError::Transport(e)))) => {
                    return Outcome::Failed(GustError::Request(e));
                }
                Ok(Some(Err(e))) => {
                    run.stats.skipped += 1;
                    tracing::warn!("skipping undecodable event: {e}");
                    continue;
                }
                Ok(Some(Ok(event))) => event,
            };
            match run.absorb(&event.data, handler, handle) {
                Control::Continue => {}
                Control::Finished => return Outcome::Completed(None),
                Control::Cancelled => return Outcome::Cancelled,
                Control::Fail(e) => return Outcome::Failed(e),
            }
        }
    }

    /// Newline-delimited JSON (Ollama, llama.cpp). Lines may still carry a
    /// `data:` prefix when the server mislabels its content type.
    async fn read_lines<H: StreamHandler + ?Sized>(
        &self,
        response: reqwest::Response,
        handler: &mut H,
        handle: &CancelHandle,
        run: &mut CallRun,
    ) -> Outcome {
        let mut chunks = std::pin::pin!(response.bytes_stream());
        let mut lines = LineBuffer::new(MAX_RESPONSE_BYTES);
        loop {
            let next = tokio::select! {
                biased;
                _ = handle.token().cancelled() => return Outcome::Cancelled,
                n = tokio::time::timeout(self.stall_timeout, chunks.next()) => n,
            };
            let exhausted = matches!(next, Ok(None));
            let pending = match next {
                Err(_) => return Outcome::Failed(self.stalled()),
                Ok(Some(Err(e))) => return Outcome::Failed(GustError::Request(e)),
                Ok(Some(Ok(bytes))) => match lines.push(&bytes) {
                    Ok(complete) => complete,
                    Err(e) => return Outcome::Failed(e),
                },
                Ok(None) => lines.finish().into_iter().collect(),
            };

            for line in &pending {
                let Some(payload) = strip_sse_prefix(line) else {
                    continue;
                };
                match run.absorb(payload, handler, handle) {
                    Control::Continue => {}
                    Control::Finished => return Outcome::Completed(None),
                    Control::Cancelled => return Outcome::Cancelled,
                    Control::Fail(e) => return Outcome::Failed(e),
                }
            }
            if exhausted {
                return Outcome::Completed(None);
            }
        }
    }
}

fn too_large(len: u64) -> GustError {
    GustError::SchemaParse(format!(
        "response too large: {len} bytes exceeds {MAX_RESPONSE_BYTES}"
    ))
}

async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, GustError> {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(GustError::RateLimited {
            provider: provider.to_string(),
        });
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(GustError::AuthFailed {
            provider: provider.to_string(),
            message: format!("{status}"),
        });
    }
    if !status.is_success() {
        let bytes = response.bytes().await.unwrap_or_default();
        let truncated = &bytes[..bytes.len().min(MAX_ERROR_BODY_BYTES)];
        let text = String::from_utf8_lossy(truncated);
        return Err(GustError::Upstream {
            provider: provider.to_string(),
            message: format!("{status}: {}", text.trim()),
            status: Some(status.as_u16()),
        });
    }
    Ok(response)
}
