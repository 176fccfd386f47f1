//! Transcript persistence: one append-only log of exchanges per session.
//!
//! Backends implement [`TranscriptStore`]. The orchestrator calls them from
//! `spawn_blocking` and only ever logs their failures.

mod file;
#[cfg(feature = "redis-backing")]
mod redis_store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::cli::StoreKind;
use crate::config::StorageConfig;
use crate::error::StorageError;

pub use file::FileTranscriptStore;
#[cfg(feature = "redis-backing")]
pub use redis_store::{RedisOps, RedisTranscriptStore};

/// Session id used when a request does not carry one.
pub const DEFAULT_SESSION: &str = "default";

/// One completed exchange. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub timestamp: String,
    pub prompt: String,
    pub response: String,
    pub mode: String,
    pub model: String,
    pub session_id: String,
}

impl TranscriptEntry {
    /// Stamped with the current UTC time, millisecond precision.
    pub fn now(
        session_id: impl Into<String>,
        prompt: impl Into<String>,
        response: impl Into<String>,
        mode: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            prompt: prompt.into(),
            response: response.into(),
            mode: mode.into(),
            model: model.into(),
            session_id: session_id.into(),
        }
    }
}

/// Append-only transcript storage keyed by session id.
pub trait TranscriptStore: Send + Sync {
    fn append(&self, session_id: &str, entry: &TranscriptEntry) -> Result<(), StorageError>;

    /// Entries for a session in append order; empty for an unknown session.
    fn read(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, StorageError>;

    /// Short label for logs.
    fn backend_name(&self) -> &'static str;
}

/// Longest key [`session_key`] returns before switching to a hashed tail.
pub const MAX_SESSION_KEY_LEN: usize = 160;
const HASHED_PREFIX_LEN: usize = 112;

/// Map a client-supplied session id to a storage key over `[A-Za-z0-9_~-]`.
///
/// The key is used as a file name and a Redis key. ASCII letters, digits and
/// `-` are kept; every other UTF-8 byte, `_` included, becomes `_xx` (lower
/// hex), so distinct ids never share a key. Keys longer than
/// [`MAX_SESSION_KEY_LEN`] keep a prefix and end in `~` plus the SHA-1 of the
/// raw id. An empty id maps to [`DEFAULT_SESSION`].
pub fn session_key(raw: &str) -> String {
    if raw.is_empty() {
        return DEFAULT_SESSION.to_string();
    }
    let mut key = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            key.push(char::from(b));
        } else {
            key.push_str(&format!("_{:02x}", b));
        }
    }
    if key.len() <= MAX_SESSION_KEY_LEN {
        return key;
    }

    key.truncate(HASHED_PREFIX_LEN);
    key.push('~');
    for b in Sha1::digest(raw.as_bytes()) {
        key.push_str(&format!("{:02x}", b));
    }
    key
}

/// Open the backend named by `config.backend`.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn TranscriptStore>, StorageError> {
    match config.backend {
        StoreKind::File => Ok(Arc::new(FileTranscriptStore::open(&config.directory)?)),
        StoreKind::Memory => Ok(Arc::new(MemoryTranscriptStore::new())),
        StoreKind::Redis => open_redis(config),
    }
}

#[cfg(feature = "redis-backing")]
fn open_redis(config: &StorageConfig) -> Result<Arc<dyn TranscriptStore>, StorageError> {
    let url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| StorageError::Remote("storage.redis_url is not set".into()))?;
    Ok(Arc::new(RedisTranscriptStore::connect(url, config.redis_prefix.as_str())?))
}

#[cfg(not(feature = "redis-backing"))]
fn open_redis(_config: &StorageConfig) -> Result<Arc<dyn TranscriptStore>, StorageError> {
    Err(StorageError::Remote(
        "built without the redis-backing feature".into(),
    ))
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Process-local store; contents vanish on restart.
#[derive(Debug, Default)]
pub struct MemoryTranscriptStore {
    sessions: Mutex<HashMap<String, Vec<TranscriptEntry>>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl TranscriptStore for MemoryTranscriptStore {
    fn append(&self, session_id: &str, entry: &TranscriptEntry) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| StorageError::Remote("memory store lock poisoned".into()))?;
        sessions
            .entry(session_key(session_id))
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn read(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, StorageError> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| StorageError::Remote("memory store lock poisoned".into()))?;
        Ok(sessions
            .get(&session_key(session_id))
            .cloned()
            .unwrap_or_default())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
pub(crate) fn sample_entry(session: &str, prompt: &str, response: &str) -> TranscriptEntry {
    TranscriptEntry::now(session, prompt, response, "vibe", "Qwen/Qwen2.5-7B-Instruct")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("s1", "s1")]
    #[case("user-42", "user-42")]
    #[case("user_42", "user_5f42")]
    #[case("../../etc/passwd", "_2e_2e_2f_2e_2e_2fetc_2fpasswd")]
    #[case("a b/c", "a_20b_2fc")]
    #[case("", "default")]
    #[case("\u{fc}n", "_c3_bcn")]
    fn test_session_key(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(session_key(raw), expected);
    }

    #[rstest]
    #[case("team/alpha", "team_alpha")]
    #[case("a.b", "a?b")]
    #[case("a.b", "a_b")]
    #[case("_2e", ".")]
    fn test_session_key_keeps_ids_apart(#[case] one: &str, #[case] other: &str) {
        assert_ne!(session_key(one), session_key(other));
    }

    #[test]
    fn test_long_ids_hash_without_colliding() {
        let base = "x".repeat(500);
        let one = session_key(&format!("{}a", base));
        let other = session_key(&format!("{}b", base));
        assert_eq!(one.len(), HASHED_PREFIX_LEN + 1 + 40);
        assert!(one.len() <= MAX_SESSION_KEY_LEN);
        assert_ne!(one, other);
        assert!(one.starts_with(&"x".repeat(HASHED_PREFIX_LEN)));
    }

    #[test]
    fn test_session_key_is_path_safe() {
        let key = session_key("../\\:*?\"<>|\u{0}");
        assert!(key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '~'));
    }

    #[test]
    fn test_memory_colliding_looking_ids_stay_separate() {
        let store = MemoryTranscriptStore::new();
        store
            .append("team/alpha", &sample_entry("team/alpha", "secret", "r"))
            .expect("append");
        store
            .append("team_alpha", &sample_entry("team_alpha", "public", "r"))
            .expect("append");

        let alpha = store.read("team/alpha").expect("read");
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].prompt, "secret");
        let other = store.read("team_alpha").expect("read");
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].prompt, "public");
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let entry = sample_entry("s1", "hi", "hello");
        let v = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(v["sessionId"], "s1");
        assert_eq!(v["mode"], "vibe");
        assert!(v.get("session_id").is_none());
    }

    #[test]
    fn test_timestamp_is_rfc3339_utc_millis() {
        let entry = sample_entry("s1", "hi", "hello");
        assert!(entry.timestamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&entry.timestamp).is_ok());
        // 2024-01-01T00:00:00.000Z
        assert_eq!(entry.timestamp.len(), 24);
    }

    #[test]
    fn test_memory_append_then_read_returns_entry_last() {
        let store = MemoryTranscriptStore::new();
        store.append("s1", &sample_entry("s1", "first", "one")).expect("append");
        let entry = sample_entry("s1", "second \u{1F600}", "two\nlines");
        store.append("s1", &entry).expect("append");

        let entries = store.read("s1").expect("read");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.last(), Some(&entry));
        assert_eq!(entries[0].prompt, "first");
    }

    #[test]
    fn test_open_store_follows_config() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let mut config = StorageConfig {
            directory: dir.path().join("t"),
            ..StorageConfig::default()
        };
        assert_eq!(open_store(&config).expect("file").backend_name(), "file");
        assert!(dir.path().join("t").is_dir());

        config.backend = StoreKind::Memory;
        assert_eq!(open_store(&config).expect("memory").backend_name(), "memory");
    }

    #[cfg(not(feature = "redis-backing"))]
    #[test]
    fn test_redis_without_feature_is_error() {
        let config = StorageConfig {
            backend: StoreKind::Redis,
            redis_url: Some("redis://127.0.0.1/".into()),
            ..StorageConfig::default()
        };
        assert!(open_store(&config).is_err());
    }

    #[test]
    fn test_memory_sessions_isolated() {
        let store = MemoryTranscriptStore::new();
        store.append("a", &sample_entry("a", "p", "r")).expect("append");
        assert!(store.read("b").expect("read").is_empty());
        assert_eq!(store.session_count(), 1);
    }
}
