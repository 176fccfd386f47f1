//! # Streaming Relay Client
//!
//! Opens one streaming chat-completion call against the upstream inference
//! API and exposes the reply as a pull-based [`TokenStream`].
//!
//! Failure classification is the contract the orchestrator relies on:
//! - status 429 / 503 / other non-2xx at connect time -> pre-stream errors
//!   ([`RelayError::RateLimited`], [`RelayError::ModelUnavailable`],
//!   [`RelayError::Upstream`]);
//! - any breakage once a token has been yielded -> [`RelayError::StreamInterrupted`].
//!
//! Breakage after the headers but before the first token still counts as
//! pre-stream: nothing has reached the end user yet.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use reqwest::{Client, StatusCode};
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::error::RelayError;
use crate::providers::{ChatMessage, UpstreamChatRequest, UpstreamChunk, UpstreamErrorBody};
use crate::sse::{SseLine, SseLineDecoder};

/// Placeholder substituted with the model id in the endpoint template.
pub const MODEL_PLACEHOLDER: &str = "{model}";

/// Anything that can open a token stream for `(model, messages)`.
///
/// The HTTP implementation is [`HttpRelay`]; tests substitute scripted relays.
pub trait ChatRelay: Send + Sync {
    fn relay<'a>(
        &'a self,
        model: &'a str,
        messages: &'a [ChatMessage],
    ) -> BoxFuture<'a, Result<TokenStream, RelayError>>;
}

/// Sampling parameters passed through to the upstream unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 5000,
            temperature: 0.7,
        }
    }
}

// ---------------------------------------------------------------------------
// TokenStream
// ---------------------------------------------------------------------------

type ChunkStream = BoxStream<'static, Result<Vec<u8>, String>>;

/// Lazy, finite, non-restartable sequence of text fragments from one attempt.
pub struct TokenStream {
    chunks: ChunkStream,
    decoder: SseLineDecoder,
    pending: VecDeque<String>,
    text: String,
    yielded: usize,
    finished: bool,
    idle_timeout: Option<Duration>,
}

impl TokenStream {
    /// Wrap a raw SSE body. `idle_timeout` bounds the wait for each chunk.
    pub fn from_body<S, B, E>(body: S, idle_timeout: Option<Duration>) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + 'static,
        E: std::fmt::Display + 'static,
    {
        let chunks = body.map(|item| match item {
            Ok(bytes) => Ok(bytes.as_ref().to_vec()),
            Err(e) => Err(e.to_string()),
        });
        Self {
            chunks: Box::pin(chunks),
            decoder: SseLineDecoder::new(),
            pending: VecDeque::new(),
            text: String::new(),
            yielded: 0,
            finished: false,
            idle_timeout,
        }
    }

    /// A stream that yields exactly these fragments, then ends.
    pub fn from_tokens<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut stream = Self::from_body(
            futures_util::stream::empty::<Result<Vec<u8>, String>>(),
            None,
        );
        stream.pending = tokens
            .into_iter()
            .map(Into::into)
            .filter(|t: &String| !t.is_empty())
            .collect();
        stream
    }

    /// Next fragment, `None` at a legitimate end of stream.
    ///
    /// After an `Err` the stream is finished; further calls return `None`.
    pub async fn next_token(&mut self) -> Option<Result<String, RelayError>> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                self.text.push_str(&token);
                self.yielded += 1;
                return Some(Ok(token));
            }
            if self.finished {
                return None;
            }

            let next = match self.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.chunks.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        return Some(Err(self.fail(format!(
                            "no data from upstream for {}s",
                            limit.as_secs_f32()
                        ))))
                    }
                },
                None => self.chunks.next().await,
            };

            match next {
                Some(Ok(bytes)) => {
                    let lines = match self.decoder.feed(&bytes) {
                        Ok(lines) => lines,
                        Err(e) => return Some(Err(self.fail(e))),
                    };
                    if let Some(err) = self.absorb(lines) {
                        return Some(Err(err));
                    }
                }
                Some(Err(e)) => return Some(Err(self.fail(e))),
                None => {
                    self.finished = true;
                    let tail: Vec<SseLine> = self.decoder.finish().into_iter().collect();
                    if let Some(err) = self.absorb(tail) {
                        return Some(Err(err));
                    }
                }
            }
        }
    }

    /// Queue the fragments of decoded lines. Returns an error when a payload
    /// carries an in-band upstream error.
    fn absorb(&mut self, lines: Vec<SseLine>) -> Option<RelayError> {
        for line in lines {
            match line {
                SseLine::Done => {
                    self.finished = true;
                    break;
                }
                SseLine::Data(payload) => {
                    if let Ok(chunk) = serde_json::from_str::<UpstreamChunk>(&payload) {
                        if let Some(fragment) = chunk.fragment() {
                            self.pending.push_back(fragment.to_string());
                            continue;
                        }
                    }
                    if let Some(message) = UpstreamErrorBody::parse_message(payload.as_bytes()) {
                        // Fragments not yet handed out die with the attempt.
                        return Some(self.fail(message));
                    }
                    debug!(payload = %payload, "skipping unrecognised stream payload");
                }
            }
        }
        None
    }

    fn fail(&mut self, detail: impl std::fmt::Display) -> RelayError {
        self.finished = true;
        self.pending.clear();
        if self.yielded == 0 {
            RelayError::upstream(None, detail.to_string())
        } else {
            RelayError::StreamInterrupted(detail.to_string())
        }
    }

    /// Text accumulated from every fragment yielded so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn tokens_yielded(&self) -> usize {
        self.yielded
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_empty()
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("yielded", &self.yielded)
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HttpRelay
// ---------------------------------------------------------------------------

/// Relay client for an OpenAI-compatible streaming chat-completion endpoint.
pub struct HttpRelay {
    client: Client,
    endpoint: String,
    api_token: Option<String>,
    params: GenerationParams,
    idle_timeout: Option<Duration>,
}

impl HttpRelay {
    /// `endpoint` may contain `{model}`, which is replaced per attempt.
    pub fn new(client: Client, endpoint: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_token: None,
            params,
            idle_timeout: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.api_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = Some(idle);
        self
    }

    pub fn endpoint_for(&self, model: &str) -> String {
        self.endpoint.replace(MODEL_PLACEHOLDER, model)
    }

    async fn open(&self, model: &str, messages: &[ChatMessage]) -> Result<TokenStream, RelayError> {
        let url = self.endpoint_for(model);
        let body = UpstreamChatRequest {
            model,
            messages,
            max_tokens: self.params.max_tokens,
            temperature: self.params.temperature,
            stream: true,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let send = request.send();
        let response = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, send).await.map_err(|_| {
                RelayError::upstream(None, format!("no response from {} within {}s", model, limit.as_secs()))
            })?,
            None => send.await,
        }
        .map_err(|e| RelayError::upstream(None, e.to_string()))?;

        let status = response.status();
        if let Some(err) = classify_status(status) {
            let err = match err {
                RelayError::Upstream { status, .. } => {
                    let raw = response.bytes().await.unwrap_or_default();
                    let message = UpstreamErrorBody::parse_message(&raw).unwrap_or_else(|| {
                        format!("Upstream error {}", status.unwrap_or_default())
                    });
                    RelayError::Upstream { status, message }
                }
                other => other,
            };
            return Err(err);
        }

        Ok(TokenStream::from_body(response.bytes_stream(), self.idle_timeout))
    }
}

impl ChatRelay for HttpRelay {
    fn relay<'a>(
        &'a self,
        model: &'a str,
        messages: &'a [ChatMessage],
    ) -> BoxFuture<'a, Result<TokenStream, RelayError>> {
        Box::pin(self.open(model, messages))
    }
}

/// Map a response status onto a pre-stream failure; `None` means stream it.
///
/// The `Upstream` variant is returned with a placeholder message that the
/// caller replaces with the body's error text.
pub fn classify_status(status: StatusCode) -> Option<RelayError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Some(RelayError::RateLimited)
    } else if status == StatusCode::SERVICE_UNAVAILABLE {
        Some(RelayError::ModelUnavailable)
    } else if !status.is_success() {
        Some(RelayError::upstream(
            Some(status.as_u16()),
            format!("Upstream error {}", status.as_u16()),
        ))
    } else {
        None
    }
}
