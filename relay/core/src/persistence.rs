//! Persistence Coordinator
//!
//! Maps query lifecycle events onto [`TurnStore`] writes:
//!
//! - **begin**: the user turn, written before the agent is contacted
//! - **completed**: the assistant turn (answer text plus thinking trace in
//!   metadata), then one source record per unique candidate URL
//! - **aborted**: nothing; the user turn stays, no assistant turn is created
//!
//! Source writes go through `create_source_if_absent`, so a URL already cited
//! earlier in the thread is not duplicated.

use std::sync::Arc;

use serde_json::json;

use crate::error::AbortReason;
use crate::frame::SourceCandidate;
use crate::messages::QueryRequest;
use crate::relay::TerminalOutcome;
use crate::store::{NewSource, NewTurn, Role, TurnId, TurnStore};

/// What [`PersistenceCoordinator::finalize`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeReport {
    /// Assistant turn and sources were written
    Committed {
        /// The assistant turn
        turn_id: TurnId,
        /// Source records written or found
        sources: usize,
    },
    /// The query was aborted; nothing was written
    Discarded,
}

/// Writes the turns and sources of queries
#[derive(Clone)]
pub struct PersistenceCoordinator {
    store: Arc<dyn TurnStore>,
}

impl PersistenceCoordinator {
    /// Create a coordinator writing to `store`
    #[must_use]
    pub fn new(store: Arc<dyn TurnStore>) -> Self {
        Self { store }
    }

    /// The underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TurnStore> {
        &self.store
    }

    /// Persist the user turn of a new query
    ///
    /// # Errors
    ///
    /// Returns `AbortReason::PersistenceFailure` if the write fails; the query
    /// must not proceed.
    pub async fn begin_turn(&self, request: &QueryRequest) -> Result<TurnId, AbortReason> {
        let turn = self
            .store
            .create_turn(NewTurn {
                thread_id: request.thread_id.clone(),
                user_id: request.user_id.clone(),
                role: Role::User,
                content: request.query_text.clone(),
                metadata: None,
            })
            .await
            .map_err(|e| {
                tracing::error!(thread_id = %request.thread_id, error = %e, "Failed to save user turn");
                AbortReason::PersistenceFailure(e.to_string())
            })?;
        Ok(turn.id)
    }

    /// Persist the result of a finished query
    ///
    /// # Errors
    ///
    /// Returns `AbortReason::PersistenceFailure` on the first failed write.
    /// Sources are written after the assistant turn, so a source failure
    /// leaves the turn in place.
    pub async fn finalize(
        &self,
        thread_id: &str,
        user_id: &str,
        outcome: &TerminalOutcome,
    ) -> Result<FinalizeReport, AbortReason> {
        let aggregate = match outcome {
            TerminalOutcome::Completed(aggregate) => aggregate,
            TerminalOutcome::Aborted(reason) => {
                tracing::debug!(%thread_id, %reason, "Query aborted, nothing to persist");
                return Ok(FinalizeReport::Discarded);
            }
        };

        let turn = self
            .store
            .create_turn(NewTurn {
                thread_id: thread_id.to_string(),
                user_id: user_id.to_string(),
                role: Role::Assistant,
                content: aggregate.answer_text.clone(),
                metadata: Some(json!({ "thinking_trace": aggregate.effective_thinking_trace() })),
            })
            .await
            .map_err(|e| {
                tracing::error!(%thread_id, error = %e, "Failed to save assistant turn");
                AbortReason::PersistenceFailure(e.to_string())
            })?;

        for candidate in &aggregate.source_candidates {
            let Some(source) = new_source(thread_id, candidate) else {
                continue;
            };
            let url = source.url.clone();
            self.store
                .create_source_if_absent(source)
                .await
                .map_err(|e| {
                    tracing::error!(%thread_id, %url, error = %e, "Failed to save source");
                    AbortReason::PersistenceFailure(format!("source {url}: {e}"))
                })?;
        }

        tracing::info!(
            %thread_id,
            turn_id = %turn.id,
            sources = aggregate.source_candidates.len(),
            answer_len = aggregate.answer_text.len(),
            "Research turn saved"
        );

        Ok(FinalizeReport::Committed {
            turn_id: turn.id,
            sources: aggregate.source_candidates.len(),
        })
    }
}

fn new_source(thread_id: &str, candidate: &SourceCandidate) -> Option<NewSource> {
    let url = candidate.url.clone().filter(|u| !u.is_empty())?;
    Some(NewSource {
        thread_id: thread_id.to_string(),
        url,
        title: candidate.title.clone(),
        snippet: candidate.snippet.clone(),
        content: candidate.content.clone(),
        published_at: candidate.published_at.clone(),
    })
}
