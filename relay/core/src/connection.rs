//! Client connections
//!
//! A [`ConnectionManager`] owns one client connection's outbound queue and
//! its single-query guard. Each accepted query runs on its own task, so a slow
//! agent or a slow client only ever stalls its own connection.
//!
//! # Outbound Flow
//!
//! ```text
//! query task ──ServerMessage──▶ bounded mpsc ──▶ transport writer ──▶ client
//! ```
//!
//! The queue is bounded. When it stays full for longer than the configured
//! grace period the query is aborted with `ClientTooSlow` instead of
//! buffering without limit.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{AbortReason, Disposition};
use crate::frame::Frame;
use crate::lifecycle::{QueryLifecycle, QueryState};
use crate::messages::{ClientMessage, QueryRequest, RequestError, ServerMessage};
use crate::persistence::{FinalizeReport, PersistenceCoordinator};
use crate::relay::{cancel_pair, CancelHandle, CancelSignal, FrameSink, StreamRelay, TerminalOutcome};

/// Default outbound queue capacity per connection
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Default wait for queue space before a client counts as too slow
pub const DEFAULT_SEND_GRACE: Duration = Duration::from_millis(2000);

/// Default maximum query length in characters
pub const DEFAULT_MAX_QUERY_LENGTH: usize = 32 * 1024;

/// Unique identifier for a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection ID
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Outbound queue capacity
    pub outbound_capacity: usize,
    /// How long a full queue may block a frame
    pub send_grace: Duration,
    /// Longest accepted query, in characters
    pub max_query_length: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            send_grace: DEFAULT_SEND_GRACE,
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
        }
    }
}

/// Services shared by every connection
#[derive(Clone)]
pub struct RelayContext {
    /// Upstream relay
    pub relay: Arc<StreamRelay>,
    /// Turn and source writer
    pub persistence: PersistenceCoordinator,
    /// Per-connection tunables
    pub settings: ConnectionSettings,
}

/// Why a submission was not accepted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// A query is already in flight on this connection
    #[error("a research query is already in progress on this connection")]
    AlreadyStreaming,
    /// The request failed validation
    #[error("invalid request: {0}")]
    Invalid(#[from] RequestError),
    /// The message could not be parsed
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// How a query ended, as seen by its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    /// The answer was relayed and saved
    Completed(FinalizeReport),
    /// The query was aborted
    Aborted(AbortReason),
}

// ============================================================================
// Connection
// ============================================================================

/// One client connection
///
/// Dropping the manager cancels any query still running on it.
pub struct ConnectionManager {
    id: ConnectionId,
    outbound: mpsc::Sender<ServerMessage>,
    lifecycle: Arc<QueryLifecycle>,
    context: RelayContext,
    cancel: CancelHandle,
    signal: CancelSignal,
}

impl ConnectionManager {
    /// Create a connection and the receiving end of its outbound queue
    #[must_use]
    pub fn new(context: RelayContext) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(context.settings.outbound_capacity.max(1));
        let (cancel, signal) = cancel_pair();
        let manager = Self {
            id: ConnectionId::new(),
            outbound,
            lifecycle: Arc::new(QueryLifecycle::new()),
            context,
            cancel,
            signal,
        };
        (manager, rx)
    }

    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// State of the current query
    #[must_use]
    pub fn state(&self) -> QueryState {
        self.lifecycle.state()
    }

    /// Start a query
    ///
    /// # Errors
    ///
    /// Returns `SubmitError::Invalid` if the request fails validation and
    /// `SubmitError::AlreadyStreaming` if a query is in flight. Nothing is
    /// persisted in either case.
    pub fn submit(&self, request: QueryRequest) -> Result<JoinHandle<QueryResult>, SubmitError> {
        request.validate(self.context.settings.max_query_length)?;
        if !self.lifecycle.try_begin() {
            return Err(SubmitError::AlreadyStreaming);
        }

        let span = tracing::info_span!(
            "query",
            conn = %self.id,
            thread_id = %request.thread_id,
            user_id = %request.user_id,
        );
        let task = QueryTask {
            outbound: self.outbound.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
            context: self.context.clone(),
            signal: self.signal.clone(),
        };
        Ok(tokio::spawn(task.run(request).instrument(span)))
    }

    /// Handle one text message from the client
    ///
    /// Rejections are answered with `research_rejected` and do not affect a
    /// query already in flight.
    pub async fn handle_text(&self, text: &str) -> Option<JoinHandle<QueryResult>> {
        let submitted = match ClientMessage::parse(text) {
            Ok(ClientMessage::Research(payload)) => self.submit(payload.into()),
            Err(e) => Err(SubmitError::Malformed(e.to_string())),
        };

        match submitted {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::debug!(conn = %self.id, error = %e, "Submission rejected");
                let rejected = ServerMessage::ResearchRejected {
                    message: e.to_string(),
                };
                if self
                    .outbound
                    .send_timeout(rejected, self.context.settings.send_grace)
                    .await
                    .is_err()
                {
                    tracing::debug!(conn = %self.id, "research_rejected could not be delivered");
                }
                None
            }
        }
    }

    /// Cancel any running query
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Query task
// ============================================================================

/// Releases the single-query guard however the task ends
struct IdleGuard(Arc<QueryLifecycle>);

impl Drop for IdleGuard {
    fn drop(&mut self) {
        self.0.reset();
    }
}

struct QueryTask {
    outbound: mpsc::Sender<ServerMessage>,
    lifecycle: Arc<QueryLifecycle>,
    context: RelayContext,
    signal: CancelSignal,
}

impl QueryTask {
    async fn run(mut self, request: QueryRequest) -> QueryResult {
        let _guard = IdleGuard(Arc::clone(&self.lifecycle));
        let result = self.execute(&request).await;

        match &result {
            QueryResult::Completed(report) => {
                tracing::info!(?report, "Research query completed");
                self.enter(QueryState::Idle);
            }
            QueryResult::Aborted(reason) => {
                tracing::info!(%reason, kind = ?reason.kind(), "Research query aborted");
                // Stay Aborted until the client has been told
                self.report(reason).await;
                self.enter(QueryState::Idle);
            }
        }
        result
    }

    async fn execute(&mut self, request: &QueryRequest) -> QueryResult {
        if let Err(reason) = self.context.persistence.begin_turn(request).await {
            self.enter(QueryState::Aborted);
            return QueryResult::Aborted(reason);
        }

        let relay = Arc::clone(&self.context.relay);
        let stream = match relay.open(request, &mut self.signal).await {
            Ok(stream) => stream,
            Err(reason) => {
                self.enter(QueryState::Aborted);
                return QueryResult::Aborted(reason);
            }
        };
        self.enter(QueryState::Streaming);

        let sink = OutboundSink {
            tx: self.outbound.clone(),
            grace: self.context.settings.send_grace,
        };
        let outcome = relay.drive(stream, &sink, &mut self.signal).await;

        match &outcome {
            TerminalOutcome::Completed(_) => self.enter(QueryState::Finalizing),
            TerminalOutcome::Aborted(_) => self.enter(QueryState::Aborted),
        }

        let finalized = self
            .context
            .persistence
            .finalize(&request.thread_id, &request.user_id, &outcome)
            .await;
        match (finalized, outcome) {
            (Err(reason), _) => QueryResult::Aborted(reason),
            (Ok(report), TerminalOutcome::Completed(_)) => QueryResult::Completed(report),
            (Ok(_), TerminalOutcome::Aborted(reason)) => QueryResult::Aborted(reason),
        }
    }

    fn enter(&self, next: QueryState) {
        if let Err(e) = self.lifecycle.transition(next) {
            tracing::warn!(error = %e, "Unexpected query transition");
        }
    }

    /// Tell the client why its query ended
    async fn report(&self, reason: &AbortReason) {
        if reason.disposition() != Disposition::AbortAndReport {
            return;
        }
        let message = ServerMessage::ResearchError {
            message: reason.client_message(),
        };
        let delivered = if *reason == AbortReason::ClientTooSlow {
            // The queue is known to be full; do not wait on it again
            self.outbound.try_send(message).is_ok()
        } else {
            self.outbound
                .send_timeout(message, self.context.settings.send_grace)
                .await
                .is_ok()
        };
        if !delivered {
            tracing::debug!(%reason, "research_error could not be delivered");
        }
    }
}

/// [`FrameSink`] feeding a connection's outbound queue
struct OutboundSink {
    tx: mpsc::Sender<ServerMessage>,
    grace: Duration,
}

#[async_trait]
impl FrameSink for OutboundSink {
    async fn forward(&self, frame: &Frame) -> Result<(), AbortReason> {
        self.tx
            .send_timeout(ServerMessage::ResearchEvent(frame.clone()), self.grace)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => AbortReason::ClientTooSlow,
                SendTimeoutError::Closed(_) => AbortReason::ClientDisconnected,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelaySettings;
    use crate::store::{FailurePoint, MemoryStore, Role, TurnStore};
    use crate::upstream::{ScriptStep, ScriptedAgent};
    use pretty_assertions::assert_eq;

    const DONE: &str = r#"{"type":"done","content":{}}"#;

    fn context(
        agent: ScriptedAgent,
        settings: ConnectionSettings,
    ) -> (RelayContext, Arc<MemoryStore>, Arc<ScriptedAgent>) {
        let agent = Arc::new(agent);
        let store = Arc::new(MemoryStore::new());
        let relay = StreamRelay::new(
            agent.clone(),
            RelaySettings {
                stall_timeout: Duration::from_millis(500),
                max_consecutive_protocol_errors: 3,
            },
        );
        let context = RelayContext {
            relay: Arc::new(relay),
            persistence: PersistenceCoordinator::new(store.clone()),
            settings,
        };
        (context, store, agent)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_completed_query_relays_and_persists() {
        let (ctx, store, _) = context(
            ScriptedAgent::from_frames([r#"{"type":"answer","content":"Hi"}"#, DONE]),
            ConnectionSettings::default(),
        );
        let (conn, mut rx) = ConnectionManager::new(ctx);

        let handle = conn.submit(QueryRequest::new("q", "t1", "u1")).unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, QueryResult::Completed(_)));
        assert_eq!(conn.state(), QueryState::Idle);

        let messages = drain(&mut rx);
        assert_eq!(
            messages[0],
            ServerMessage::ResearchEvent(Frame::Answer("Hi".into()))
        );
        assert_eq!(messages.len(), 2);

        let turns = store.turns_for_thread("t1", 10, 0).await.unwrap();
        let roles: Vec<_> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, [Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_second_submit_rejected_while_streaming() {
        let (ctx, store, _) = context(
            ScriptedAgent::new(vec![ScriptStep::Delay(Duration::from_millis(100))]),
            ConnectionSettings::default(),
        );
        let (conn, mut rx) = ConnectionManager::new(ctx);

        let first = conn.submit(QueryRequest::new("q1", "t1", "u1")).unwrap();
        assert_eq!(
            conn.submit(QueryRequest::new("q2", "t1", "u1")).unwrap_err(),
            SubmitError::AlreadyStreaming
        );

        let text = r#"{"event":"research","data":{"query":"q3","threadId":"t1","userId":"u1"}}"#;
        assert!(conn.handle_text(text).await.is_none());

        first.await.unwrap();
        // Only the first query's user turn was written
        assert_eq!(store.count_turns("t1").await.unwrap(), 1);

        let messages = drain(&mut rx);
        assert!(matches!(
            messages[0],
            ServerMessage::ResearchRejected { .. }
        ));
        assert!(matches!(
            messages.last(),
            Some(ServerMessage::ResearchError { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_and_malformed_messages_are_rejected() {
        let (ctx, store, agent) = context(
            ScriptedAgent::from_frames([DONE]),
            ConnectionSettings {
                max_query_length: 10,
                ..ConnectionSettings::default()
            },
        );
        let (conn, mut rx) = ConnectionManager::new(ctx);

        assert!(conn.handle_text("{not json").await.is_none());
        let long = r#"{"event":"research","data":{"query":"this is far too long","threadId":"t","userId":"u"}}"#;
        assert!(conn.handle_text(long).await.is_none());

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        assert!(messages
            .iter()
            .all(|m| matches!(m, ServerMessage::ResearchRejected { .. })));
        assert!(store.all_turns().is_empty());
        assert!(agent.requests().is_empty());
    }

    #[tokio::test]
    async fn test_begin_turn_failure_skips_upstream() {
        let (ctx, store, agent) = context(
            ScriptedAgent::from_frames([DONE]),
            ConnectionSettings::default(),
        );
        store.inject_failure(FailurePoint::AllWrites);
        let (conn, mut rx) = ConnectionManager::new(ctx);

        let result = conn
            .submit(QueryRequest::new("q", "t1", "u1"))
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(
            result,
            QueryResult::Aborted(AbortReason::PersistenceFailure(_))
        ));
        assert!(agent.requests().is_empty());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::ResearchError { .. }]
        ));
    }

    #[tokio::test]
    async fn test_disconnect_aborts_silently() {
        let (ctx, store, agent) = context(
            ScriptedAgent::new(vec![
                ScriptStep::Chunk(b"data: {\"type\":\"answer\",\"content\":\"A\"}\n".to_vec()),
                ScriptStep::Hang,
            ]),
            ConnectionSettings::default(),
        );
        let (conn, mut rx) = ConnectionManager::new(ctx);

        let handle = conn.submit(QueryRequest::new("q", "t1", "u1")).unwrap();
        // Wait for the first relayed frame
        assert!(rx.recv().await.is_some());
        conn.disconnect();

        let result = handle.await.unwrap();
        assert_eq!(result, QueryResult::Aborted(AbortReason::ClientDisconnected));
        assert_eq!(agent.open_streams(), 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(store.count_turns("t1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_aborts_with_client_too_slow() {
        let frames: Vec<String> = (0..8)
            .map(|i| format!(r#"{{"type":"answer","content":"{i}"}}"#))
            .chain(std::iter::once(DONE.to_string()))
            .collect();
        let (ctx, store, _) = context(
            ScriptedAgent::from_frames(frames),
            ConnectionSettings {
                outbound_capacity: 2,
                send_grace: Duration::from_millis(30),
                ..ConnectionSettings::default()
            },
        );
        // Keep the receiver alive but never read it
        let (conn, _rx) = ConnectionManager::new(ctx);

        let result = conn
            .submit(QueryRequest::new("q", "t1", "u1"))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result, QueryResult::Aborted(AbortReason::ClientTooSlow));
        // No assistant turn for an aborted query
        assert_eq!(store.count_turns("t1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_aborted_query_holds_guard_until_error_is_queued() {
        let (ctx, store, _) = context(
            ScriptedAgent::from_frames([
                r#"{"type":"answer","content":"A"}"#,
                r#"{"type":"error","content":"boom"}"#,
            ]),
            ConnectionSettings {
                outbound_capacity: 2,
                send_grace: Duration::from_millis(500),
                ..ConnectionSettings::default()
            },
        );
        let (conn, mut rx) = ConnectionManager::new(ctx);

        let handle = conn.submit(QueryRequest::new("q1", "t1", "u1")).unwrap();
        // Both frames fill the queue; research_error is waiting for room
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conn.state(), QueryState::Aborted);
        assert_eq!(
            conn.submit(QueryRequest::new("q2", "t1", "u1")).unwrap_err(),
            SubmitError::AlreadyStreaming
        );
        assert_eq!(store.count_turns("t1").await.unwrap(), 1);

        // Reading one message frees a slot for the error
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::ResearchEvent(Frame::Answer("A".into())))
        );
        let result = handle.await.unwrap();
        assert_eq!(
            result,
            QueryResult::Aborted(AbortReason::UpstreamReported("boom".into()))
        );
        assert_eq!(conn.state(), QueryState::Idle);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [
                ServerMessage::ResearchEvent(Frame::Error(_)),
                ServerMessage::ResearchError { .. }
            ]
        ));
        assert!(conn.submit(QueryRequest::new("q2", "t1", "u1")).is_ok());
    }

    #[tokio::test]
    async fn test_undeliverable_rejection_does_not_block() {
        let (ctx, _, _) = context(
            ScriptedAgent::from_frames([DONE]),
            ConnectionSettings {
                outbound_capacity: 1,
                send_grace: Duration::from_millis(20),
                ..ConnectionSettings::default()
            },
        );
        let (conn, _rx) = ConnectionManager::new(ctx);

        // First rejection fills the queue, the second times out
        assert!(conn.handle_text("{not json").await.is_none());
        assert!(conn.handle_text("{not json").await.is_none());
        assert_eq!(conn.state(), QueryState::Idle);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }
}
