//! # Stage: HTTP Front
//!
//! ## Responsibility
//! Accept connections, parse one HTTP/1.1 request per connection, and route
//! it: chat requests become an SSE stream fed by the orchestrator, image
//! requests are proxied, and a few small JSON/text endpoints report health.
//!
//! ## Guarantees
//! - Every response carries `Access-Control-Allow-Origin: *`
//! - `/vibe` validation failures are answered before admission
//! - The SSE status line is committed lazily, so a request that fails on every
//!   candidate still gets a proper `503` JSON body
//! - Request bodies over [`MAX_BODY_BYTES`] are refused with `413`
//! - After shutdown, open connections are drained for a grace period before
//!   the server returns
//!
//! ## NOT Responsible For
//! - Keep-alive, pipelining, or chunked request bodies (one request, then close)
//! - TLS (terminate in front of the relay)

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{ConfigError, ServerError};
use crate::image::{HttpImageProxy, ImageGenerator};
use crate::orchestrator::{ChatEvent, ChatRequest, Orchestrator};
use crate::queue::AdmissionQueue;
use crate::relay::HttpRelay;
use crate::sse::{token_frame, DONE_FRAME};
use crate::transcript::open_store;

/// Largest request body accepted.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;
const HEAD_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 64;

pub const LIVENESS_TEXT: &str =
    "Vibe relay is active. Chat on POST /vibe, generate images on POST /image";

const SSE_HEAD: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\nAccess-Control-Allow-Origin: *\r\n\r\n";

/// Everything a connection handler needs.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub images: Arc<dyn ImageGenerator>,
}

impl AppState {
    /// Wire the HTTP relay, image proxy, transcript store and queue from
    /// config. One shared `reqwest::Client` serves both upstreams.
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.upstream.connect_timeout())
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        let token = config.api_token();
        if token.is_none() {
            warn!(var = %config.upstream.token_env, "no API token set, calling upstream anonymously");
        }

        let relay = HttpRelay::new(
            client.clone(),
            config.upstream.chat_url.clone(),
            config.generation_params(),
        )
        .with_token(token.clone())
        .with_idle_timeout(config.upstream.idle_timeout());
        let images =
            HttpImageProxy::new(client, config.upstream.image_url.clone()).with_token(token);

        let store = open_store(&config.storage)?;
        info!(backend = store.backend_name(), "transcript store ready");

        let orchestrator = Orchestrator::new(
            Arc::new(relay),
            store,
            config.personas()?,
            AdmissionQueue::new(config.queue.max_concurrent),
        );
        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            images: Arc::new(images),
        })
    }
}

/// One task per connection, tracked in a `JoinSet`. Once `shutdown` resolves
/// the listener is dropped and open connections are drained for up to
/// `grace`; whatever is still running after that is aborted.
///
/// Closing the admission queue is the caller's job. Doing it inside
/// `shutdown` lets queued chats answer `503` during the drain.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: F,
    grace: Duration,
) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                connections.spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        debug!(peer = %peer, error = %e, "connection error");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => {
                info!(open = connections.len(), "shutdown requested, no longer accepting connections");
                break;
            }
        }
    }
    drop(listener);

    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            aborted = connections.len(),
            grace_secs = grace.as_secs(),
            "connections still open after shutdown grace, aborting"
        );
        connections.shutdown().await;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Path with any query string removed.
    pub path: String,
    pub body: Vec<u8>,
}

/// Read one request. `Ok(None)` when the peer closed before sending anything.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<HttpRequest>, ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let head_len = loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ServerError::Malformed("connection closed mid-request".into()));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(idx) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break idx + 4;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ServerError::Malformed("request head too large".into()));
        }
    };

    let head = std::str::from_utf8(&buf[..head_len])
        .map_err(|_| ServerError::Malformed("request head is not UTF-8".into()))?;
    let mut lines = head.split("\r\n");

    // Request line: "POST /vibe?x=1 HTTP/1.1"
    let parts: Vec<&str> = lines.next().unwrap_or("").split_whitespace().collect();
    let (method, target) = match parts.as_slice() {
        [method, target, version]
            if version.starts_with("HTTP/")
                && !method.is_empty()
                && method.bytes().all(|b| b.is_ascii_uppercase()) =>
        {
            (method.to_string(), *target)
        }
        _ => return Err(ServerError::Malformed("invalid request line".into())),
    };
    let path = target.split('?').next().unwrap_or("/").to_string();
    let content_length = body_length(lines.filter(|l| !l.is_empty()))?;

    if content_length > MAX_BODY_BYTES {
        return Err(ServerError::PayloadTooLarge {
            limit: MAX_BODY_BYTES,
        });
    }

    let total = head_len + content_length;
    while buf.len() < total {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::Malformed("body shorter than Content-Length".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Ok(Some(HttpRequest {
        method,
        path,
        body: buf[head_len..total].to_vec(),
    }))
}

fn body_length<'a>(header_lines: impl Iterator<Item = &'a str>) -> Result<usize, ServerError> {
    let mut length = 0;
    for (i, line) in header_lines.enumerate() {
        if i >= MAX_HEADERS {
            return Err(ServerError::Malformed("too many headers".into()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ServerError::Malformed(format!("invalid header line: {}", line)))?;
        if name.trim().eq_ignore_ascii_case("transfer-encoding") {
            return Err(ServerError::Malformed("chunked request bodies are not supported".into()));
        }
        if name.trim().eq_ignore_ascii_case("content-length") {
            length = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ServerError::Malformed("invalid Content-Length".into()))?;
        }
    }
    Ok(length)
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

async fn handle_connection<S>(mut stream: S, state: Arc<AppState>) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match tokio::time::timeout(HEAD_TIMEOUT, read_request(&mut stream)).await {
        Err(_) => return Ok(()),
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(request))) => request,
        Ok(Err(ServerError::PayloadTooLarge { limit })) => {
            let message = format!("Request body exceeds {} bytes", limit);
            return write_json_error(&mut stream, 413, &message).await;
        }
        Ok(Err(ServerError::Malformed(m))) => {
            debug!(reason = %m, "malformed request");
            return write_json_error(&mut stream, 400, "Malformed request").await;
        }
        Ok(Err(e)) => return Err(e),
    };

    debug!(method = %request.method, path = %request.path, "request");

    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => {
            let head = "HTTP/1.1 204 No Content\r\nAccess-Control-Allow-Origin: *\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type, Authorization\r\nAccess-Control-Max-Age: 86400\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
            stream.write_all(head.as_bytes()).await?;
            Ok(())
        }
        ("GET", "/") => {
            write_response(&mut stream, 200, "text/plain; charset=utf-8", LIVENESS_TEXT.as_bytes()).await
        }
        ("GET", "/status") => {
            let body = serde_json::to_vec(&state.orchestrator.queue().snapshot())
                .unwrap_or_else(|_| b"{}".to_vec());
            write_response(&mut stream, 200, "application/json", &body).await
        }
        ("POST", "/vibe") => handle_vibe(&mut stream, &state, &request.body).await,
        ("POST", "/image") => handle_image(&mut stream, &state, &request.body).await,
        (_, "/" | "/status" | "/vibe" | "/image") => {
            write_json_error(&mut stream, 405, "Method not allowed").await
        }
        _ => write_json_error(&mut stream, 404, "Not found").await,
    }
}

async fn handle_vibe<S>(stream: &mut S, state: &AppState, body: &[u8]) -> Result<(), ServerError>
where
    S: AsyncWrite + Unpin,
{
    let request = match ChatRequest::from_json(body) {
        Ok(request) => request,
        Err(e) => return write_json_error(stream, e.status(), &e.to_string()).await,
    };

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let orchestrator = Arc::clone(&state.orchestrator);
    let task = tokio::spawn(async move { orchestrator.submit(request, tx).await });

    let written = write_events(stream, rx).await;
    match task.await {
        Ok(outcome) => debug!(?outcome, "chat finished"),
        Err(e) => warn!(error = %e, "chat task failed"),
    }
    written
}

/// Drain orchestrator events onto the connection.
///
/// The SSE head is written on the first token or `Done`. A `Rejected` event
/// before that becomes a JSON error response instead.
pub async fn write_events<W>(stream: &mut W, mut rx: mpsc::Receiver<ChatEvent>) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let mut committed = false;
    while let Some(event) = rx.recv().await {
        match event {
            ChatEvent::Token(text) | ChatEvent::Notice(text) => {
                if !committed {
                    stream.write_all(SSE_HEAD.as_bytes()).await?;
                    committed = true;
                }
                stream.write_all(token_frame(&text).as_bytes()).await?;
                stream.flush().await?;
            }
            ChatEvent::Done => {
                if !committed {
                    stream.write_all(SSE_HEAD.as_bytes()).await?;
                }
                stream.write_all(DONE_FRAME.as_bytes()).await?;
                stream.flush().await?;
                return Ok(());
            }
            ChatEvent::Rejected { status, error } => {
                if committed {
                    stream.write_all(DONE_FRAME.as_bytes()).await?;
                    stream.flush().await?;
                    return Ok(());
                }
                return write_json_error(stream, status, &error).await;
            }
        }
    }

    // The orchestrator stopped without a terminal event.
    if committed {
        stream.write_all(DONE_FRAME.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    } else {
        write_json_error(stream, 500, "Internal server error").await
    }
}

#[derive(Debug, Deserialize)]
struct ImageBody {
    #[serde(default)]
    prompt: Option<String>,
}

async fn handle_image<S>(stream: &mut S, state: &AppState, body: &[u8]) -> Result<(), ServerError>
where
    S: AsyncWrite + Unpin,
{
    let prompt = match serde_json::from_slice::<ImageBody>(body) {
        Err(_) => return write_json_error(stream, 400, "Invalid JSON body").await,
        Ok(ImageBody { prompt }) => match prompt.filter(|p| !p.trim().is_empty()) {
            Some(p) => p,
            None => return write_json_error(stream, 400, "Prompt is required").await,
        },
    };

    match state.images.generate(&prompt).await {
        Ok(bytes) => {
            info!(bytes = bytes.len(), "image generated");
            write_response(stream, 200, "image/png", &bytes).await
        }
        Err(e) => {
            warn!(error = %e, "image generation failed");
            write_json_error(stream, 500, &e.to_string()).await
        }
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

async fn write_response<W>(stream: &mut W, status: u16, content_type: &str, body: &[u8]) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        status,
        reason(status),
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn write_json_error<W>(stream: &mut W, status: u16, message: &str) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::json!({ "error": message }).to_string();
    write_response(stream, status, "application/json", body.as_bytes()).await
}
