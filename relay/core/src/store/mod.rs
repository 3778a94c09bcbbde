//! Turn and source storage
//!
//! The relay persists through the [`TurnStore`] trait so the backing database
//! can be swapped without touching the orchestration logic.
//!
//! # Available Stores
//!
//! - [`MemoryStore`]: process-local maps (tests, ephemeral deployments)
//! - [`SqliteStore`]: SQLite via `sqlx`
//!
//! `create_turn` is **not** idempotent: every call creates a record.
//! `create_source_if_absent` is idempotent on `(thread_id, url)`.

mod memory;
mod sqlite;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[cfg(any(test, feature = "test-util"))]
pub use memory::FailurePoint;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Identifier of a persisted turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub Uuid);

impl TurnId {
    /// Generate a new random ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person asking
    User,
    /// The research agent
    Assistant,
}

impl Role {
    /// Storage representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// A persisted message in a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Record ID
    pub id: TurnId,
    /// Owning thread
    pub thread_id: String,
    /// Owning user
    pub user_id: String,
    /// Author
    pub role: Role,
    /// Message text
    pub content: String,
    /// Extra data, e.g. `{"thinking_trace": [...]}` on assistant turns
    pub metadata: Option<Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Input to [`TurnStore::create_turn`]
#[derive(Debug, Clone, PartialEq)]
pub struct NewTurn {
    /// Owning thread
    pub thread_id: String,
    /// Owning user
    pub user_id: String,
    /// Author
    pub role: Role,
    /// Message text
    pub content: String,
    /// Extra data
    pub metadata: Option<Value>,
}

/// A persisted citation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Record ID
    pub id: Uuid,
    /// Owning thread
    pub thread_id: String,
    /// Source URL, unique per thread
    pub url: String,
    /// Page title
    pub title: Option<String>,
    /// Short excerpt
    pub snippet: Option<String>,
    /// Extracted content
    pub content: Option<String>,
    /// Publication date as reported upstream
    pub published_at: Option<String>,
    /// When the source was first recorded
    pub accessed_at: DateTime<Utc>,
}

/// Input to [`TurnStore::create_source_if_absent`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewSource {
    /// Owning thread
    pub thread_id: String,
    /// Source URL
    pub url: String,
    /// Page title
    pub title: Option<String>,
    /// Short excerpt
    pub snippet: Option<String>,
    /// Extracted content
    pub content: Option<String>,
    /// Publication date
    pub published_at: Option<String>,
}

/// Storage failure
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database driver error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored data could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Store is not accepting writes
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence collaborator consumed by the relay
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite")
    fn name(&self) -> &str;

    /// Create a new turn (never deduplicated)
    async fn create_turn(&self, turn: NewTurn) -> Result<Turn, StoreError>;

    /// Create a source, or return the existing record for `(thread_id, url)`
    async fn create_source_if_absent(&self, source: NewSource) -> Result<SourceRecord, StoreError>;

    /// Turns of a thread, oldest first
    async fn turns_for_thread(
        &self,
        thread_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Turn>, StoreError>;

    /// Sources of a thread, most recently accessed first
    async fn sources_for_thread(&self, thread_id: &str) -> Result<Vec<SourceRecord>, StoreError>;

    /// Number of turns in a thread
    async fn count_turns(&self, thread_id: &str) -> Result<usize, StoreError> {
        Ok(self.turns_for_thread(thread_id, usize::MAX, 0).await?.len())
    }
}
