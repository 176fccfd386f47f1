//! Streaming chat relay.
//!
//! A thin backend between a chat front end and a hosted inference API:
//! requests wait in a bounded FIFO [`queue`], the [`orchestrator`] walks a
//! persona's candidate models through the [`relay`] until one streams, tokens
//! go back to the browser as server-sent events via [`web`], and finished
//! exchanges land in a [`transcript`] store.

pub mod cli;
pub mod config;
pub mod error;
pub mod image;
pub mod orchestrator;
pub mod persona;
pub mod providers;
pub mod queue;
pub mod relay;
pub mod sse;
pub mod transcript;
pub mod web;

pub use error::{ChatError, ConfigError, RelayError, ServerError, StorageError};
pub use orchestrator::{ChatEvent, ChatOutcome, ChatRequest, Orchestrator};
pub use relay::{ChatRelay, HttpRelay, TokenStream};
pub use transcript::{TranscriptEntry, TranscriptStore};
