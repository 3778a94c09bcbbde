//! In-memory store
//!
//! Keeps turns and sources in process-local maps behind a `parking_lot` lock.
//! Nothing survives a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
#[cfg(any(test, feature = "test-util"))]
use parking_lot::Mutex;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{NewSource, NewTurn, Role, SourceRecord, StoreError, Turn, TurnId, TurnStore};

/// Writes that an in-memory store can be told to refuse
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePoint {
    /// Accept everything
    #[default]
    None,
    /// Refuse every write
    AllWrites,
    /// Refuse assistant turns only
    AssistantTurns,
    /// Refuse source writes only
    Sources,
}

#[derive(Debug, Default)]
struct Inner {
    turns: Vec<Turn>,
    sources: Vec<SourceRecord>,
    /// `(thread_id, url)` → index into `sources`
    source_index: HashMap<(String, String), usize>,
}

/// A write about to happen
#[cfg_attr(not(any(test, feature = "test-util")), allow(dead_code))]
#[derive(Debug, Clone, Copy)]
enum Write {
    Turn(Role),
    Source,
}

/// Process-local [`TurnStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    #[cfg(any(test, feature = "test-util"))]
    failure: Mutex<FailurePoint>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes matching `point` fail
    #[cfg(any(test, feature = "test-util"))]
    pub fn inject_failure(&self, point: FailurePoint) {
        *self.failure.lock() = point;
    }

    /// All turns across threads, in creation order
    #[must_use]
    pub fn all_turns(&self) -> Vec<Turn> {
        self.inner.read().turns.clone()
    }

    /// All sources across threads, in creation order
    #[must_use]
    pub fn all_sources(&self) -> Vec<SourceRecord> {
        self.inner.read().sources.clone()
    }

    #[cfg(any(test, feature = "test-util"))]
    fn check(&self, write: Write) -> Result<(), StoreError> {
        let refused = matches!(
            (*self.failure.lock(), write),
            (FailurePoint::AllWrites, _)
                | (FailurePoint::AssistantTurns, Write::Turn(Role::Assistant))
                | (FailurePoint::Sources, Write::Source)
        );
        if refused {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    #[cfg(not(any(test, feature = "test-util")))]
    #[allow(clippy::unused_self, clippy::unnecessary_wraps)]
    fn check(&self, _write: Write) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl TurnStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_turn(&self, turn: NewTurn) -> Result<Turn, StoreError> {
        self.check(Write::Turn(turn.role))?;

        let record = Turn {
            id: TurnId::new(),
            thread_id: turn.thread_id,
            user_id: turn.user_id,
            role: turn.role,
            content: turn.content,
            metadata: turn.metadata,
            created_at: Utc::now(),
        };
        self.inner.write().turns.push(record.clone());
        Ok(record)
    }

    async fn create_source_if_absent(&self, source: NewSource) -> Result<SourceRecord, StoreError> {
        self.check(Write::Source)?;

        let mut inner = self.inner.write();
        let key = (source.thread_id.clone(), source.url.clone());
        if let Some(&index) = inner.source_index.get(&key) {
            return Ok(inner.sources[index].clone());
        }

        let record = SourceRecord {
            id: Uuid::new_v4(),
            thread_id: source.thread_id,
            url: source.url,
            title: source.title,
            snippet: source.snippet,
            content: source.content,
            published_at: source.published_at,
            accessed_at: Utc::now(),
        };
        let index = inner.sources.len();
        inner.sources.push(record.clone());
        inner.source_index.insert(key, index);
        Ok(record)
    }

    async fn turns_for_thread(
        &self,
        thread_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Turn>, StoreError> {
        Ok(self
            .inner
            .read()
            .turns
            .iter()
            .filter(|t| t.thread_id == thread_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn sources_for_thread(&self, thread_id: &str) -> Result<Vec<SourceRecord>, StoreError> {
        let mut sources: Vec<SourceRecord> = self
            .inner
            .read()
            .sources
            .iter()
            .rev()
            .filter(|s| s.thread_id == thread_id)
            .cloned()
            .collect();
        sources.sort_by(|a, b| b.accessed_at.cmp(&a.accessed_at));
        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(thread: &str, role: Role, content: &str) -> NewTurn {
        NewTurn {
            thread_id: thread.to_string(),
            user_id: "u1".to_string(),
            role,
            content: content.to_string(),
            metadata: None,
        }
    }

    fn source(thread: &str, url: &str, title: &str) -> NewSource {
        NewSource {
            thread_id: thread.to_string(),
            url: url.to_string(),
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_turns_are_never_deduplicated() {
        let store = MemoryStore::new();
        store.create_turn(turn("t1", Role::User, "same")).await.unwrap();
        store.create_turn(turn("t1", Role::User, "same")).await.unwrap();
        assert_eq!(store.count_turns("t1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_source_idempotent_per_thread() {
        let store = MemoryStore::new();
        let first = store
            .create_source_if_absent(source("t1", "https://x.test/a", "A"))
            .await
            .unwrap();
        let second = store
            .create_source_if_absent(source("t1", "https://x.test/a", "changed"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.title.as_deref(), Some("A"));

        // Same URL in another thread is a separate record
        let other = store
            .create_source_if_absent(source("t2", "https://x.test/a", "A"))
            .await
            .unwrap();
        assert_ne!(other.id, first.id);
        assert_eq!(store.all_sources().len(), 2);
    }

    #[tokio::test]
    async fn test_turn_pagination() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .create_turn(turn("t1", Role::User, &format!("q{i}")))
                .await
                .unwrap();
        }
        store.create_turn(turn("t2", Role::User, "other")).await.unwrap();

        let page = store.turns_for_thread("t1", 2, 1).await.unwrap();
        let contents: Vec<_> = page.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, ["q1", "q2"]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.inject_failure(FailurePoint::AssistantTurns);
        assert!(store.create_turn(turn("t", Role::User, "q")).await.is_ok());
        assert!(store
            .create_turn(turn("t", Role::Assistant, "a"))
            .await
            .is_err());

        store.inject_failure(FailurePoint::AllWrites);
        assert!(store.create_turn(turn("t", Role::User, "q")).await.is_err());

        store.inject_failure(FailurePoint::None);
        assert!(store
            .create_source_if_absent(source("t", "https://x.test", "x"))
            .await
            .is_ok());
    }
}
