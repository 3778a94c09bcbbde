//! Client and upstream message types
//!
//! Client surfaces talk to the relay with JSON envelopes of the form
//! `{"event": <name>, "data": <body>}`:
//!
//! | direction        | event               | body                                        |
//! |------------------|---------------------|---------------------------------------------|
//! | client → relay   | `research`          | `{query, threadId, userId, showThinking?}`  |
//! | relay → client   | `research_event`    | an upstream frame, `{type, content}`        |
//! | relay → client   | `research_error`    | `{message}`, once per aborted query         |
//! | relay → client   | `research_rejected` | `{message}`, submission not accepted        |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::Frame;

/// One research submission
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRequest {
    /// Natural-language query
    pub query_text: String,
    /// Conversation the query belongs to
    pub thread_id: String,
    /// Submitting user
    pub user_id: String,
    /// Whether the agent should stream thinking steps
    pub show_thinking: bool,
}

impl QueryRequest {
    /// Create a request with thinking enabled
    pub fn new(
        query_text: impl Into<String>,
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            query_text: query_text.into(),
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            show_thinking: true,
        }
    }

    /// Set whether thinking steps are streamed
    #[must_use]
    pub fn with_show_thinking(mut self, show_thinking: bool) -> Self {
        self.show_thinking = show_thinking;
        self
    }

    /// Check the request before anything is persisted
    ///
    /// # Errors
    ///
    /// Returns a `RequestError` naming the first offending field.
    pub fn validate(&self, max_query_length: usize) -> Result<(), RequestError> {
        if self.query_text.trim().is_empty() {
            return Err(RequestError::EmptyQuery);
        }
        let length = self.query_text.chars().count();
        if length > max_query_length {
            return Err(RequestError::QueryTooLong {
                length,
                max: max_query_length,
            });
        }
        if self.thread_id.trim().is_empty() {
            return Err(RequestError::MissingField("threadId"));
        }
        if self.user_id.trim().is_empty() {
            return Err(RequestError::MissingField("userId"));
        }
        Ok(())
    }

    /// Body of the upstream `POST /research/stream` call
    #[must_use]
    pub fn agent_body(&self) -> AgentRequestBody<'_> {
        AgentRequestBody {
            query: &self.query_text,
            thread_id: &self.thread_id,
            user_id: &self.user_id,
            show_thinking: self.show_thinking,
        }
    }
}

/// Rejected submission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Query is empty or whitespace
    #[error("query must not be empty")]
    EmptyQuery,
    /// Query exceeds the configured length
    #[error("query is {length} characters, limit is {max}")]
    QueryTooLong {
        /// Characters submitted
        length: usize,
        /// Configured limit
        max: usize,
    },
    /// Required identifier missing
    #[error("missing {0}")]
    MissingField(&'static str),
}

/// JSON body sent to the research agent
#[derive(Debug, Serialize)]
pub struct AgentRequestBody<'a> {
    /// Query text
    pub query: &'a str,
    /// Thread identifier
    pub thread_id: &'a str,
    /// User identifier
    pub user_id: &'a str,
    /// Whether to stream thinking steps
    pub show_thinking: bool,
}

/// Body of a client `research` message
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchPayload {
    /// Query text
    pub query: String,
    /// Thread identifier
    pub thread_id: String,
    /// User identifier
    pub user_id: String,
    /// Defaults to `true` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_thinking: Option<bool>,
}

impl From<ResearchPayload> for QueryRequest {
    fn from(payload: ResearchPayload) -> Self {
        Self {
            query_text: payload.query,
            thread_id: payload.thread_id,
            user_id: payload.user_id,
            show_thinking: payload.show_thinking.unwrap_or(true),
        }
    }
}

/// Messages from a client surface
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a research query
    Research(ResearchPayload),
}

impl ClientMessage {
    /// Parse a client text message
    ///
    /// # Errors
    ///
    /// Returns the serde error if the envelope or body is malformed.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Messages to a client surface
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A relayed upstream frame
    ResearchEvent(Frame),
    /// The query was aborted
    ResearchError {
        /// Human-readable reason
        message: String,
    },
    /// The submission was not accepted
    ResearchRejected {
        /// Human-readable reason
        message: String,
    },
}

impl ServerMessage {
    /// Serialize to the JSON text sent over the wire
    ///
    /// # Errors
    ///
    /// Returns the serde error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
