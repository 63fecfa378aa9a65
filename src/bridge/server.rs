//! HTTP boundary: `POST /ssh`.
//!
//! # Request
//!
//! ```json
//! {"server_ip": "web", "command_string": "uptime"}
//! ```
//!
//! # Response
//!
//! The body is the command's combined stdout/stderr as `text/plain`.
//!
//! In [`OutputMode::Stream`] the handler waits for whichever comes first: the
//! first output chunk or the end of the command.
//!
//! - The command ended first: the status is exact. `200` on success, otherwise
//!   `400`/`500` with any captured output followed by the error text.
//! - Output came first: the status is `200` and the body streams. A failure
//!   after that point is appended as a trailer frame (see [`trailer_frame`]).
//!
//! In [`OutputMode::Buffered`] the whole output is collected before replying
//! and the status always reflects the outcome.
//!
//! # Limits of stream mode
//!
//! Once a streamed `200` is sent the outcome is carried in-band only. The
//! trailer is plain text in the same body, so a command printing a line that
//! looks like a trailer cannot be told apart from a real one. A body that ends
//! early because the connection dropped carries no trailer and reads like a
//! success. Callers that must know the outcome should use buffered mode.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use poem::http::StatusCode;
use poem::{Body, Endpoint, Request, Response, Route, post};
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::error::{ErrorKind, ExecError};
use super::exec::Executor;
use super::relay;
use super::session::SessionFactory;

const CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Chunks buffered between the relay and the response body
const BODY_CHANNEL_CAPACITY: usize = 32;

/// JSON body of `POST /ssh`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecRequest {
    #[serde(rename = "server_ip")]
    pub host: String,
    #[serde(rename = "command_string")]
    pub command: String,
}

/// How command output is returned to HTTP callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Stream,
    Buffered,
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "streaming" => Ok(OutputMode::Stream),
            "buffered" | "buffer" => Ok(OutputMode::Buffered),
            other => Err(format!("unknown output mode '{}'", other)),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Stream => f.write_str("stream"),
            OutputMode::Buffered => f.write_str("buffered"),
        }
    }
}

/// Frame appended to a streamed body when the command fails after output began.
pub fn trailer_frame(err: &ExecError) -> Bytes {
    Bytes::from(format!("\n[hssh] error: {}\n", err))
}

fn status_for(err: &ExecError) -> StatusCode {
    match err.kind() {
        ErrorKind::Client => StatusCode::BAD_REQUEST,
        ErrorKind::Server => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn text_response(status: StatusCode, body: impl Into<Body>) -> Response {
    Response::builder()
        .status(status)
        .content_type(CONTENT_TYPE)
        .body(body)
}

/// Response for a command that already finished.
fn finished_response(result: Result<(), ExecError>, captured: Vec<u8>) -> Response {
    match result {
        Ok(()) => text_response(StatusCode::OK, captured),
        Err(e) => {
            error!("Request failed: {}", e);
            if captured.is_empty() {
                return text_response(status_for(&e), e.to_string());
            }
            let mut body = captured;
            body.extend_from_slice(&trailer_frame(&e));
            text_response(status_for(&e), body)
        }
    }
}

/// [`AsyncWrite`] adapter feeding a response body channel.
///
/// Writes are buffered; every flush sends the buffered bytes as one chunk.
/// Once the receiving side is gone, writes and flushes fail with `BrokenPipe`.
pub struct ChunkSender {
    buf: BytesMut,
    tx: PollSender<Bytes>,
}

impl ChunkSender {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            buf: BytesMut::new(),
            tx: PollSender::new(tx),
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response body closed")
}

impl AsyncWrite for ChunkSender {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.tx.is_closed() {
            return Poll::Ready(Err(broken_pipe()));
        }
        this.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.buf.is_empty() {
            return Poll::Ready(Ok(()));
        }
        ready!(this.tx.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        let chunk = this.buf.split().freeze();
        this.tx.send_item(chunk).map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        self.get_mut().tx.close();
        Poll::Ready(Ok(()))
    }
}

/// Run the request and produce the HTTP response for `mode`.
pub async fn respond<F>(executor: Arc<Executor<F>>, mode: OutputMode, request: ExecRequest) -> Response
where
    F: SessionFactory + 'static,
{
    info!("Executing command on '{}'", request.host);
    match mode {
        OutputMode::Buffered => {
            let mut captured: Vec<u8> = Vec::new();
            let result = executor
                .execute(&request.host, &request.command, &mut captured)
                .await;
            match result {
                Ok(()) => finished_response(Ok(()), captured),
                Err(e) => finished_response(Err(e), Vec::new()),
            }
        }
        OutputMode::Stream => stream_response(executor, request).await,
    }
}

async fn stream_response<F>(executor: Arc<Executor<F>>, request: ExecRequest) -> Response
where
    F: SessionFactory + 'static,
{
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Bytes>(BODY_CHANNEL_CAPACITY);
    let (mut writer, reader) = relay::pipe();

    let relay_task = relay::spawn_relay(reader, ChunkSender::new(chunk_tx));
    let mut exec_task: JoinHandle<Result<(), ExecError>> = tokio::spawn(
        async move {
            let result = executor
                .execute(&request.host, &request.command, &mut writer)
                .await;
            // EOF for the relay
            let _ = writer.shutdown().await;
            result
        }
        .in_current_span(),
    );

    tokio::select! {
        biased;

        joined = &mut exec_task => {
            let result = joined_result(joined);
            // The relay ends once the pipe is drained; the channel closes with it
            let mut captured = Vec::new();
            while let Some(chunk) = chunk_rx.recv().await {
                captured.extend_from_slice(&chunk);
            }
            let _ = relay_task.await;
            finished_response(result, captured)
        }

        first = chunk_rx.recv() => match first {
            Some(first) => {
                debug!("First output chunk ready, streaming response");
                streaming_response(first, chunk_rx, exec_task)
            }
            None => {
                let result = joined_result(exec_task.await);
                finished_response(result, Vec::new())
            }
        },
    }
}

fn joined_result(joined: Result<Result<(), ExecError>, tokio::task::JoinError>) -> Result<(), ExecError> {
    joined.unwrap_or_else(|e| Err(ExecError::CommandFailed(format!("executor task failed: {}", e))))
}

/// 200 response whose body is `first`, the rest of the relay, then a trailer on failure.
fn streaming_response(
    first: Bytes,
    mut chunk_rx: mpsc::Receiver<Bytes>,
    exec_task: JoinHandle<Result<(), ExecError>>,
) -> Response {
    let (body_tx, body_rx) = mpsc::channel::<Bytes>(BODY_CHANNEL_CAPACITY);

    tokio::spawn(
        async move {
            let mut client_gone = false;
            while let Some(chunk) = chunk_rx.recv().await {
                if body_tx.send(chunk).await.is_err() {
                    client_gone = true;
                    break;
                }
            }
            // Dropping the receiver makes the relay stop, which fails the executor's writes
            drop(chunk_rx);

            match joined_result(exec_task.await) {
                Ok(()) => {}
                Err(e) if client_gone => {
                    warn!("Client went away, command ended with: {}", e);
                }
                Err(e) => {
                    warn!("Command failed after output was sent: {}", e);
                    let _ = body_tx.send(trailer_frame(&e)).await;
                }
            }
        }
        .in_current_span(),
    );

    let tail = stream::unfold(body_rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, io::Error>(chunk), rx))
    });
    let body = stream::iter([Ok::<_, io::Error>(first)]).chain(tail);

    text_response(StatusCode::OK, Body::from_bytes_stream(body))
}

/// Endpoint behind `POST /ssh`.
pub struct SshEndpoint<F: SessionFactory = super::session::RusshSessionFactory> {
    executor: Arc<Executor<F>>,
    mode: OutputMode,
}

impl<F: SessionFactory> SshEndpoint<F> {
    pub fn new(executor: Arc<Executor<F>>, mode: OutputMode) -> Self {
        Self { executor, mode }
    }
}

impl<F: SessionFactory + 'static> Endpoint for SshEndpoint<F> {
    type Output = Response;

    async fn call(&self, req: Request) -> poem::Result<Response> {
        let span = info_span!("ssh_request", request_id = %Uuid::new_v4());
        async move {
            let raw = req.into_body().into_vec().await?;
            let request: ExecRequest = match serde_json::from_slice(&raw) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Rejecting request body: {}", e);
                    return Ok(text_response(StatusCode::BAD_REQUEST, e.to_string()));
                }
            };
            Ok(respond(self.executor.clone(), self.mode, request).await)
        }
        .instrument(span)
        .await
    }
}

/// Routes served by the bridge.
pub fn routes<F: SessionFactory + 'static>(executor: Arc<Executor<F>>, mode: OutputMode) -> Route {
    Route::new().at("/ssh", post(SshEndpoint::new(executor, mode)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::session::ChannelEvent;
    use crate::bridge::testing::{FakeFactory, fixture_resolver, output};
    use poem::test::TestClient;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn app(factory: FakeFactory, mode: OutputMode, deadline: Duration) -> (NamedTempFile, Route) {
        let (config, resolver) = fixture_resolver();
        let executor = Arc::new(Executor::new(resolver, factory, deadline));
        (config, routes(executor, mode))
    }

    fn body(host: &str, command: &str) -> serde_json::Value {
        json!({"server_ip": host, "command_string": command})
    }

    mod output_mode {
        use super::*;

        #[test]
        fn test_parse() {
            assert_eq!("stream".parse(), Ok(OutputMode::Stream));
            assert_eq!("Buffered".parse(), Ok(OutputMode::Buffered));
            assert!("chunky".parse::<OutputMode>().is_err());
        }

        #[test]
        fn test_default_is_stream() {
            assert_eq!(OutputMode::default(), OutputMode::Stream);
        }
    }

    mod chunk_sender {
        use super::*;

        #[tokio::test]
        async fn test_flush_sends_one_chunk() {
            let (tx, mut rx) = mpsc::channel(4);
            let mut sender = ChunkSender::new(tx);

            sender.write_all(b"ab").await.unwrap();
            sender.write_all(b"cd").await.unwrap();
            sender.flush().await.unwrap();

            assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"abcd"));
        }

        #[tokio::test]
        async fn test_closed_receiver_is_broken_pipe() {
            let (tx, rx) = mpsc::channel(4);
            drop(rx);
            let mut sender = ChunkSender::new(tx);

            let result = async {
                sender.write_all(b"x").await?;
                sender.flush().await
            }
            .await;
            assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        }

        #[tokio::test]
        async fn test_shutdown_ends_stream() {
            let (tx, mut rx) = mpsc::channel(4);
            let mut sender = ChunkSender::new(tx);

            sender.write_all(b"last").await.unwrap();
            sender.shutdown().await.unwrap();

            assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"last"));
            assert!(rx.recv().await.is_none());
        }
    }

    mod request_decoding {
        use super::*;

        #[tokio::test]
        async fn test_malformed_json_is_bad_request() {
            let factory = FakeFactory::default();
            let (_config, route) = app(factory.clone(), OutputMode::Stream, Duration::from_secs(5));
            let cli = TestClient::new(route);

            let resp = cli
                .post("/ssh")
                .content_type("application/json")
                .body("{not json")
                .send()
                .await;
            resp.assert_status(StatusCode::BAD_REQUEST);
            assert_eq!(factory.opens(), 0);
        }

        #[tokio::test]
        async fn test_missing_field_is_bad_request() {
            let factory = FakeFactory::default();
            let (_config, route) = app(factory.clone(), OutputMode::Stream, Duration::from_secs(5));
            let cli = TestClient::new(route);

            let resp = cli
                .post("/ssh")
                .body_json(&json!({"server_ip": "web"}))
                .send()
                .await;
            resp.assert_status(StatusCode::BAD_REQUEST);
            assert_eq!(factory.opens(), 0);
        }

        #[tokio::test]
        async fn test_empty_command_is_bad_request() {
            let factory = FakeFactory::default();
            let (_config, route) = app(factory.clone(), OutputMode::Stream, Duration::from_secs(5));
            let cli = TestClient::new(route);

            let resp = cli.post("/ssh").body_json(&body("web", "")).send().await;
            resp.assert_status(StatusCode::BAD_REQUEST);
            resp.assert_text("invalid request: command must not be empty")
                .await;
        }

        #[tokio::test]
        async fn test_get_is_not_allowed() {
            let (_config, route) =
                app(FakeFactory::default(), OutputMode::Stream, Duration::from_secs(5));
            let cli = TestClient::new(route);

            let resp = cli.get("/ssh").send().await;
            resp.assert_status(StatusCode::METHOD_NOT_ALLOWED);
        }
    }

    mod streaming {
        use super::*;

        #[tokio::test]
        async fn test_success_streams_output() {
            let factory = FakeFactory::with_events(vec![
                output("hello\n"),
                output("world\n"),
                ChannelEvent::ExitStatus(0),
            ]);
            let (_config, route) = app(factory.clone(), OutputMode::Stream, Duration::from_secs(5));
            let cli = TestClient::new(route);

            let resp = cli.post("/ssh").body_json(&body("web", "echo")).send().await;
            resp.assert_status_is_ok();
            resp.assert_text("hello\nworld\n").await;
            assert_eq!(factory.closes(), 1);
        }

        #[tokio::test]
        async fn test_failure_before_output_is_server_error() {
            let factory = FakeFactory {
                refuse: true,
                ..Default::default()
            };
            let (_config, route) = app(factory, OutputMode::Stream, Duration::from_secs(5));
            let cli = TestClient::new(route);

            let resp = cli.post("/ssh").body_json(&body("web", "ls")).send().await;
            resp.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
            resp.assert_text("failed to dial to remote web:22: connection refused")
                .await;
        }

        #[tokio::test]
        async fn test_failure_after_output_appends_trailer() {
            let factory = FakeFactory {
                events: vec![output("partial\n")],
                hang: true,
                ..Default::default()
            };
            let (_config, route) =
                app(factory.clone(), OutputMode::Stream, Duration::from_millis(300));
            let cli = TestClient::new(route);

            let resp = cli.post("/ssh").body_json(&body("web", "tail -f x")).send().await;
            resp.assert_status_is_ok();
            let text = resp.0.into_body().into_string().await.unwrap();
            assert!(text.starts_with("partial\n"), "{text}");
            assert!(
                text.ends_with("\n[hssh] error: command timed out after 300ms\n"),
                "{text}"
            );
            assert_eq!(factory.closes(), 1);
        }

        #[tokio::test]
        async fn test_trailer_lookalike_output_passes_through() {
            let printed = "\n[hssh] error: command timed out after 1s\n";
            let factory =
                FakeFactory::with_events(vec![output(printed), ChannelEvent::ExitStatus(0)]);
            let (_config, route) = app(factory, OutputMode::Stream, Duration::from_secs(5));
            let cli = TestClient::new(route);

            let resp = cli.post("/ssh").body_json(&body("web", "cat log")).send().await;
            resp.assert_status_is_ok();
            resp.assert_text(printed).await;
        }
    }

    mod buffered {
        use super::*;

        #[tokio::test]
        async fn test_success_returns_all_output() {
            let factory = FakeFactory::with_events(vec![
                output("a"),
                output("b"),
                ChannelEvent::ExitStatus(0),
            ]);
            let (_config, route) = app(factory, OutputMode::Buffered, Duration::from_secs(5));
            let cli = TestClient::new(route);

            let resp = cli.post("/ssh").body_json(&body("web", "ls")).send().await;
            resp.assert_status_is_ok();
            resp.assert_text("ab").await;
        }

        #[tokio::test]
        async fn test_failure_after_output_is_server_error() {
            let factory = FakeFactory::with_events(vec![
                output("partial"),
                ChannelEvent::ExitStatus(2),
            ]);
            let (_config, route) = app(factory, OutputMode::Buffered, Duration::from_secs(5));
            let cli = TestClient::new(route);

            let resp = cli.post("/ssh").body_json(&body("web", "false")).send().await;
            resp.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
            resp.assert_text("command failed: process exited with status 2")
                .await;
        }
    }

    mod finished {
        use super::*;

        #[tokio::test]
        async fn test_captured_output_precedes_error_text() {
            let resp = finished_response(
                Err(ExecError::CommandFailed("process exited with status 1".to_string())),
                b"out".to_vec(),
            );
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let text = resp.into_body().into_string().await.unwrap();
            assert_eq!(
                text,
                "out\n[hssh] error: command failed: process exited with status 1\n"
            );
        }

        #[tokio::test]
        async fn test_client_error_status() {
            let resp = finished_response(Err(ExecError::InvalidInput("x".to_string())), Vec::new());
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
    }
}
