//! Stream Relay
//!
//! Drives one research query from the agent's byte stream to the client:
//!
//! ```text
//! ResearchAgent ──bytes──▶ FrameDecoder ──Frame──▶ Aggregator
//!                                          │
//!                                          └──────▶ FrameSink (client)
//! ```
//!
//! Every decoded frame is forwarded to the sink in arrival order, unmodified,
//! before the next chunk is read. The relay stops reading at the first
//! terminal frame (`done` or `error`); anything the agent sends after it is
//! never decoded.
//!
//! A query ends in exactly one [`TerminalOutcome`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;

use crate::aggregate::{Aggregate, AggregateDelta, Aggregator};
use crate::error::{AbortReason, ProtocolErrorBudget, DEFAULT_MAX_CONSECUTIVE_PROTOCOL_ERRORS};
use crate::frame::{Frame, FrameDecoder};
use crate::messages::QueryRequest;
use crate::upstream::{ChunkStream, ResearchAgent};

/// Default bound on the gap between upstream chunks
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Outcome and sink
// ============================================================================

/// How a query ended
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    /// A `done` frame arrived
    Completed(Aggregate),
    /// The query was aborted
    Aborted(AbortReason),
}

impl TerminalOutcome {
    /// Whether the query completed
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Destination for relayed frames
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Deliver one frame
    ///
    /// # Errors
    ///
    /// Returns `ClientDisconnected` or `ClientTooSlow` when the frame cannot be
    /// delivered; the relay aborts the query with that reason.
    async fn forward(&self, frame: &Frame) -> Result<(), AbortReason>;
}

// ============================================================================
// Cancellation
// ============================================================================

/// Owner side of a query's cancellation flag
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    /// Cancel the query
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Observer side of a query's cancellation flag
///
/// Dropping every [`CancelHandle`] counts as cancellation.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&mut self) {
        // Err means the handle is gone
        let _ = self.0.wait_for(|cancelled| *cancelled).await;
    }
}

/// Create a linked handle and signal
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

// ============================================================================
// Relay
// ============================================================================

/// Tunables for [`StreamRelay`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Longest wait for the agent's response or its next chunk
    pub stall_timeout: Duration,
    /// Malformed lines tolerated in a row
    pub max_consecutive_protocol_errors: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            max_consecutive_protocol_errors: DEFAULT_MAX_CONSECUTIVE_PROTOCOL_ERRORS,
        }
    }
}

/// Decodes, aggregates and forwards one agent stream at a time
///
/// A relay is shared across queries; all per-query state lives in
/// [`StreamRelay::drive`].
pub struct StreamRelay {
    agent: Arc<dyn ResearchAgent>,
    settings: RelaySettings,
}

impl StreamRelay {
    /// Create a relay over `agent`
    #[must_use]
    pub fn new(agent: Arc<dyn ResearchAgent>, settings: RelaySettings) -> Self {
        Self { agent, settings }
    }

    /// The upstream agent
    #[must_use]
    pub fn agent(&self) -> &Arc<dyn ResearchAgent> {
        &self.agent
    }

    /// Current settings
    #[must_use]
    pub fn settings(&self) -> RelaySettings {
        self.settings
    }

    /// Open the agent stream for `request`
    ///
    /// # Errors
    ///
    /// Returns `UpstreamUnavailable` if the agent refuses, `UpstreamTimeout`
    /// if it does not answer within the stall bound, and `ClientDisconnected`
    /// if `cancel` fires first.
    pub async fn open(
        &self,
        request: &QueryRequest,
        cancel: &mut CancelSignal,
    ) -> Result<ChunkStream, AbortReason> {
        let stall = self.settings.stall_timeout;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AbortReason::ClientDisconnected),
            opened = tokio::time::timeout(stall, self.agent.open_stream(request)) => {
                opened.map_err(|_| AbortReason::UpstreamTimeout(stall))?
            }
        }
    }

    /// Pump `stream` until a terminal frame, a failure, or cancellation
    ///
    /// Dropping the stream on return releases the upstream connection.
    pub async fn drive(
        &self,
        mut stream: ChunkStream,
        sink: &dyn FrameSink,
        cancel: &mut CancelSignal,
    ) -> TerminalOutcome {
        let stall = self.settings.stall_timeout;
        let mut decoder = FrameDecoder::new();
        let mut aggregator = Aggregator::new();
        let mut budget = ProtocolErrorBudget::new(self.settings.max_consecutive_protocol_errors);

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!("Query cancelled while streaming");
                    return TerminalOutcome::Aborted(AbortReason::ClientDisconnected);
                }
                next = tokio::time::timeout(stall, stream.next()) => next,
            };

            let at_eof = match next {
                Err(_) => {
                    tracing::warn!(stall_secs = stall.as_secs(), "Research agent stalled");
                    return TerminalOutcome::Aborted(AbortReason::UpstreamTimeout(stall));
                }
                Ok(Some(Err(reason))) => return TerminalOutcome::Aborted(reason),
                Ok(Some(Ok(bytes))) => {
                    decoder.push(&bytes);
                    false
                }
                Ok(None) => {
                    decoder.finish();
                    true
                }
            };

            loop {
                let frame = match decoder.decode() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping malformed frame");
                        if let Err(reason) = budget.record_error(&e) {
                            return TerminalOutcome::Aborted(reason);
                        }
                        continue;
                    }
                };
                budget.record_success();

                let delta = aggregator.apply(&frame);
                tracing::trace!(kind = %frame.kind(), ?delta, "Frame applied");

                if let Err(reason) = sink.forward(&frame).await {
                    return TerminalOutcome::Aborted(reason);
                }

                match delta {
                    AggregateDelta::Completed { .. } => {
                        if budget.total() > 0 {
                            tracing::info!(skipped = budget.total(), "Completed with malformed frames");
                        }
                        return TerminalOutcome::Completed(aggregator.into_aggregate());
                    }
                    AggregateDelta::Aborted { message } => {
                        return TerminalOutcome::Aborted(AbortReason::UpstreamReported(message));
                    }
                    _ => {}
                }
            }

            if at_eof {
                return TerminalOutcome::Aborted(AbortReason::UpstreamUnavailable(
                    "stream ended before a done frame".to_string(),
                ));
            }
        }
    }

    /// Open and drive a query
    pub async fn run(
        &self,
        request: &QueryRequest,
        sink: &dyn FrameSink,
        cancel: &mut CancelSignal,
    ) -> TerminalOutcome {
        match self.open(request, cancel).await {
            Ok(stream) => self.drive(stream, sink, cancel).await,
            Err(reason) => TerminalOutcome::Aborted(reason),
        }
    }
}
