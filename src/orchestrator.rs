//! # Stage: Fallback Orchestrator
//!
//! ## Responsibility
//! Take a validated [`ChatRequest`] through admission, walk its persona's
//! candidate models until one streams, forward tokens as [`ChatEvent`]s, and
//! persist the finished exchange.
//!
//! ## Guarantees
//! - A request holds an admission slot from the first attempt until its last
//!   event has been sent and its transcript written
//! - Pre-stream failures advance to the next candidate; nothing has reached
//!   the client yet
//! - Once a token has been forwarded the request is bound to that model: a
//!   later failure produces exactly one [`STREAM_LOST_NOTICE`] and `Done`
//! - Every request ends with exactly one terminal event (`Done` or
//!   `Rejected`) unless the client has gone away
//! - Transcripts are written only for completed streams; storage failures are
//!   logged and never reach the client
//!
//! ## NOT Responsible For
//! - HTTP framing (see `web`)
//! - Noticing a client that disconnects while still queued

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ChatError, RelayError};
use crate::persona::{build_messages, PersonaSet, DEFAULT_PERSONA};
use crate::providers::{ChatMessage, Role};
use crate::queue::AdmissionQueue;
use crate::relay::ChatRelay;
use crate::transcript::{TranscriptEntry, TranscriptStore, DEFAULT_SESSION};

/// Token sent when an upstream stream breaks after output has started.
pub const STREAM_LOST_NOTICE: &str = "\n\n[Error: Connection lost during generation. Please retry.]";

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A chat request that passed validation. Immutable once admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub prompt: String,
    pub mode: String,
    pub history: Vec<ChatMessage>,
    pub session_id: String,
}

/// `POST /vibe` body as it arrives on the wire.
#[derive(Debug, Deserialize)]
struct VibeRequestBody {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    history: Option<Vec<ChatMessage>>,
    #[serde(default, rename = "sessionId")]
    session_id: Option<String>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: DEFAULT_PERSONA.to_string(),
            history: Vec::new(),
            session_id: DEFAULT_SESSION.to_string(),
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    /// Parse and validate a `POST /vibe` body.
    pub fn from_json(body: &[u8]) -> Result<Self, ChatError> {
        let raw: VibeRequestBody = serde_json::from_slice(body)
            .map_err(|_| ChatError::InvalidRequest("Invalid JSON body".into()))?;
        raw.validate()
    }
}

impl VibeRequestBody {
    fn validate(self) -> Result<ChatRequest, ChatError> {
        let prompt = self
            .prompt
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ChatError::InvalidRequest("Prompt is required".into()))?;

        let history = self.history.unwrap_or_default();
        if history.iter().any(|m| m.role == Role::System) {
            return Err(ChatError::InvalidRequest(
                "History entries must have role user or assistant".into(),
            ));
        }

        Ok(ChatRequest {
            prompt,
            mode: self
                .mode
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_PERSONA.to_string()),
            history,
            session_id: self
                .session_id
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_SESSION.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Events and outcomes
// ---------------------------------------------------------------------------

/// What the HTTP side writes to the client, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Token(String),
    /// In-stream error text, sent as a token frame.
    Notice(String),
    Done,
    /// The request failed before any output; becomes a JSON error response.
    Rejected { status: u16, error: String },
}

/// How one request ended. Returned for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    Succeeded { model: String, text: String },
    FallbackExhausted { attempts: usize, last_error: Option<RelayError> },
    StreamFailed { model: String, error: RelayError },
    Disconnected,
    Rejected,
}

/// Result of one candidate model.
enum Attempt {
    Completed(String),
    Retryable(RelayError),
    Terminal(RelayError),
    Disconnected,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    relay: Arc<dyn ChatRelay>,
    store: Arc<dyn TranscriptStore>,
    personas: PersonaSet,
    queue: AdmissionQueue,
}

impl Orchestrator {
    pub fn new(
        relay: Arc<dyn ChatRelay>,
        store: Arc<dyn TranscriptStore>,
        personas: PersonaSet,
        queue: AdmissionQueue,
    ) -> Self {
        Self {
            relay,
            store,
            personas,
            queue,
        }
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    pub fn personas(&self) -> &PersonaSet {
        &self.personas
    }

    /// Run `request` to completion, sending its events to `events`.
    ///
    /// Waits for an admission slot first. A closed queue answers with a
    /// `Rejected` event.
    pub async fn submit(&self, request: ChatRequest, events: mpsc::Sender<ChatEvent>) -> ChatOutcome {
        let request_id = Uuid::new_v4();
        debug!(%request_id, queued = self.queue.queued(), "waiting for admission");

        let _admission = match self.queue.admit().await {
            Ok(admission) => admission,
            Err(_) => {
                let err = ChatError::ShuttingDown;
                let _ = events
                    .send(ChatEvent::Rejected {
                        status: err.status(),
                        error: err.to_string(),
                    })
                    .await;
                return ChatOutcome::Rejected;
            }
        };

        let persona = self.personas.resolve(&request.mode);
        let candidates = self.personas.candidates(persona);
        let messages = build_messages(persona, &request.history, &request.prompt);
        info!(
            %request_id,
            session = %request.session_id,
            mode = %persona.name,
            active = self.queue.active(),
            "request admitted"
        );

        let mut all_rate_limited = true;
        let mut last_error: Option<RelayError> = None;

        for (i, model) in candidates.iter().enumerate() {
            info!(%request_id, model = %model, attempt = i + 1, of = candidates.len(), "trying model");

            match self.attempt(model, &messages, &events).await {
                Attempt::Completed(text) => {
                    info!(%request_id, model = %model, chars = text.len(), "stream completed");
                    let entry = TranscriptEntry::now(
                        request.session_id.as_str(),
                        request.prompt.as_str(),
                        text.as_str(),
                        persona.name.as_str(),
                        model.as_str(),
                    );
                    self.persist(request_id, &request.session_id, entry).await;
                    let _ = events.send(ChatEvent::Done).await;
                    return ChatOutcome::Succeeded {
                        model: model.clone(),
                        text,
                    };
                }
                Attempt::Retryable(err) => {
                    warn!(%request_id, model = %model, error = %err, "model failed before streaming, falling back");
                    all_rate_limited &= err.is_rate_limit();
                    last_error = Some(err);
                }
                Attempt::Terminal(err) => {
                    warn!(%request_id, model = %model, error = %err, "stream lost after output started");
                    let _ = events.send(ChatEvent::Notice(STREAM_LOST_NOTICE.to_string())).await;
                    let _ = events.send(ChatEvent::Done).await;
                    return ChatOutcome::StreamFailed {
                        model: model.clone(),
                        error: err,
                    };
                }
                Attempt::Disconnected => {
                    info!(%request_id, model = %model, "client disconnected, upstream cancelled");
                    return ChatOutcome::Disconnected;
                }
            }
        }

        let err = ChatError::FallbackExhausted {
            rate_limited: all_rate_limited && last_error.is_some(),
            last_error: last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "no candidate models".to_string()),
        };
        warn!(%request_id, attempts = candidates.len(), error = %err, "all models failed");
        let _ = events
            .send(ChatEvent::Rejected {
                status: err.status(),
                error: err.to_string(),
            })
            .await;
        ChatOutcome::FallbackExhausted {
            attempts: candidates.len(),
            last_error,
        }
    }

    async fn attempt(
        &self,
        model: &str,
        messages: &[ChatMessage],
        events: &mpsc::Sender<ChatEvent>,
    ) -> Attempt {
        let mut stream = match self.relay.relay(model, messages).await {
            Ok(stream) => stream,
            Err(err) if err.is_retryable() => return Attempt::Retryable(err),
            Err(err) => return Attempt::Terminal(err),
        };

        let mut forwarded = 0usize;
        while let Some(next) = stream.next_token().await {
            match next {
                Ok(token) => {
                    // A closed receiver means the client is gone; dropping
                    // `stream` aborts the upstream request.
                    if events.send(ChatEvent::Token(token)).await.is_err() {
                        return Attempt::Disconnected;
                    }
                    forwarded += 1;
                }
                Err(err) if forwarded == 0 && err.is_retryable() => return Attempt::Retryable(err),
                Err(err) => return Attempt::Terminal(err),
            }
        }
        Attempt::Completed(stream.into_text())
    }

    async fn persist(&self, request_id: Uuid, session_id: &str, entry: TranscriptEntry) {
        let store = Arc::clone(&self.store);
        let session = session_id.to_string();
        let result = tokio::task::spawn_blocking(move || store.append(&session, &entry)).await;
        match result {
            Ok(Ok(())) => debug!(%request_id, session = %session_id, "transcript saved"),
            Ok(Err(e)) => warn!(%request_id, session = %session_id, error = %e, "failed to save transcript"),
            Err(e) => warn!(%request_id, session = %session_id, error = %e, "transcript task panicked"),
        }
    }
}
