//! # Stage: Redis Transcript Store
//!
//! ## Responsibility
//! Keep each session as a Redis list of JSON-encoded entries under
//! `<prefix>:<session>`, appended with RPUSH so LRANGE returns them in order.
//!
//! ## Guarantees
//! - Appends are atomic per entry (a single RPUSH), even across processes
//! - Non-panicking: every Redis failure surfaces as [`StorageError::Remote`]
//! - Entries that fail to decode on read are skipped, not fatal
//!
//! ## NOT Responsible For
//! - Reconnecting after the connection drops (restart the process)
//! - Redis authentication / TLS (configure via the URL)

use std::sync::Mutex;

use tracing::warn;

use crate::error::StorageError;

use super::{session_key, TranscriptEntry, TranscriptStore};

/// The handful of Redis commands the store needs. Lets tests swap in a mock.
pub trait RedisOps: Send {
    fn rpush(&mut self, key: &str, value: &str) -> Result<(), String>;
    fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, String>;
    fn ping(&mut self) -> Result<(), String>;
}

impl RedisOps for redis::Connection {
    fn rpush(&mut self, key: &str, value: &str) -> Result<(), String> {
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query::<()>(self)
            .map_err(|e| e.to_string())
    }

    fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, String> {
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query::<Vec<String>>(self)
            .map_err(|e| e.to_string())
    }

    fn ping(&mut self) -> Result<(), String> {
        redis::cmd("PING")
            .query::<String>(self)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

pub struct RedisTranscriptStore {
    ops: Mutex<Box<dyn RedisOps>>,
    prefix: String,
}

impl RedisTranscriptStore {
    /// Open a blocking connection to `url`; fails if Redis does not answer PING.
    pub fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(|e| StorageError::Remote(e.to_string()))?;
        let mut conn = client
            .get_connection()
            .map_err(|e| StorageError::Remote(format!("Redis connection failed: {}", e)))?;
        RedisOps::ping(&mut conn)
            .map_err(|e| StorageError::Remote(format!("Redis ping failed: {}", e)))?;
        Ok(Self::with_ops(Box::new(conn), prefix))
    }

    pub fn with_ops(ops: Box<dyn RedisOps>, prefix: impl Into<String>) -> Self {
        Self {
            ops: Mutex::new(ops),
            prefix: prefix.into(),
        }
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}:{}", self.prefix, session_key(session_id))
    }
}

impl TranscriptStore for RedisTranscriptStore {
    fn append(&self, session_id: &str, entry: &TranscriptEntry) -> Result<(), StorageError> {
        let json = serde_json::to_string(entry)?;
        let mut ops = self
            .ops
            .lock()
            .map_err(|_| StorageError::Remote("redis connection lock poisoned".into()))?;
        ops.rpush(&self.key(session_id), &json)
            .map_err(StorageError::Remote)
    }

    fn read(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, StorageError> {
        let key = self.key(session_id);
        let raw = {
            let mut ops = self
                .ops
                .lock()
                .map_err(|_| StorageError::Remote("redis connection lock poisoned".into()))?;
            ops.lrange(&key, 0, -1).map_err(StorageError::Remote)?
        };
        Ok(raw
            .iter()
            .filter_map(|json| match serde_json::from_str(json) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping undecodable transcript entry");
                    None
                }
            })
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::sample_entry;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Shared so a test can inspect what the store wrote.
    #[derive(Clone, Default)]
    struct MockRedisOps {
        lists: Arc<Mutex<HashMap<String, Vec<String>>>>,
        fail: bool,
    }

    impl RedisOps for MockRedisOps {
        fn rpush(&mut self, key: &str, value: &str) -> Result<(), String> {
            if self.fail {
                return Err("connection reset".into());
            }
            self.lists
                .lock()
                .map_err(|e| e.to_string())?
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
            Ok(())
        }

        fn lrange(&mut self, key: &str, _start: isize, _stop: isize) -> Result<Vec<String>, String> {
            if self.fail {
                return Err("connection reset".into());
            }
            Ok(self
                .lists
                .lock()
                .map_err(|e| e.to_string())?
                .get(key)
                .cloned()
                .unwrap_or_default())
        }

        fn ping(&mut self) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn test_append_uses_prefixed_session_key() {
        let mock = MockRedisOps::default();
        let store = RedisTranscriptStore::with_ops(Box::new(mock.clone()), "vibe:chat");
        store
            .append("a/b", &sample_entry("a/b", "p", "r"))
            .expect("append");
        let lists = mock.lists.lock().expect("lock");
        assert!(lists.contains_key("vibe:chat:a_2fb"));
    }

    #[test]
    fn test_read_returns_entries_in_append_order() {
        let store = RedisTranscriptStore::with_ops(Box::new(MockRedisOps::default()), "t");
        let first = sample_entry("s", "one", "1");
        let second = sample_entry("s", "two", "2");
        store.append("s", &first).expect("append");
        store.append("s", &second).expect("append");
        assert_eq!(store.read("s").expect("read"), vec![first, second]);
    }

    #[test]
    fn test_undecodable_entries_skipped() {
        let mock = MockRedisOps::default();
        mock.lists
            .lock()
            .expect("lock")
            .insert("t:s".into(), vec!["garbage".into()]);
        let store = RedisTranscriptStore::with_ops(Box::new(mock), "t");
        store.append("s", &sample_entry("s", "p", "r")).expect("append");
        assert_eq!(store.read("s").expect("read").len(), 1);
    }

    #[test]
    fn test_redis_failure_is_remote_error() {
        let mock = MockRedisOps {
            fail: true,
            ..Default::default()
        };
        let store = RedisTranscriptStore::with_ops(Box::new(mock), "t");
        let err = store.append("s", &sample_entry("s", "p", "r")).unwrap_err();
        assert!(matches!(err, StorageError::Remote(ref m) if m.contains("reset")));
    }
}
