//! Per-query state aggregation
//!
//! An [`Aggregator`] accumulates everything a single research query produces:
//! the answer text, the ordered thinking trace, and the deduplicated source
//! candidates. It performs no I/O; the relay feeds it frames and reads the
//! result back once the stream terminates.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::frame::{Frame, SourceCandidate};

/// Where the aggregate is in its lifetime
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    /// Frames are still being applied
    #[default]
    InProgress,
    /// A `done` frame was applied
    Completed,
    /// An `error` frame was applied
    Aborted,
}

impl AggregateStatus {
    /// Whether no further frames will be applied
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Accumulated state of one in-flight query
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Aggregate {
    /// Concatenated answer fragments
    pub answer_text: String,
    /// Thinking steps in arrival order
    pub thinking_trace: Vec<Value>,
    /// Final trace carried by the `done` frame, if any
    pub final_thinking_trace: Option<Vec<Value>>,
    /// Unique source candidates in first-seen order
    pub source_candidates: Vec<SourceCandidate>,
    /// Lifetime status
    pub status: AggregateStatus,
}

impl Aggregate {
    /// The trace to persist: the `done` frame's trace wins over the streamed one
    #[must_use]
    pub fn effective_thinking_trace(&self) -> &[Value] {
        self.final_thinking_trace
            .as_deref()
            .unwrap_or(&self.thinking_trace)
    }
}

/// What a single [`Aggregator::apply`] call changed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AggregateDelta {
    /// A thinking step was appended at `index`
    ThinkingAppended {
        /// Position in the trace
        index: usize,
    },
    /// Answer text grew by `appended` bytes
    AnswerAppended {
        /// Bytes appended
        appended: usize,
        /// Total answer length in bytes
        total: usize,
    },
    /// Sources were merged
    SourcesMerged {
        /// Candidates with a new URL
        added: usize,
        /// Candidates whose URL was already known
        duplicates: usize,
        /// Candidates without a URL
        skipped: usize,
    },
    /// The query completed
    Completed {
        /// Whether the `done` frame supplied a superseding trace
        final_trace: bool,
    },
    /// The agent reported an error
    Aborted {
        /// Agent's message
        message: String,
    },
    /// The aggregate was already terminal; nothing changed
    Ignored,
}

/// Accumulator for one query
///
/// Owned exclusively by the task running that query.
#[derive(Debug, Default)]
pub struct Aggregator {
    aggregate: Aggregate,
    seen_urls: HashSet<String>,
}

impl Aggregator {
    /// Create an empty aggregator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame into the aggregate
    pub fn apply(&mut self, frame: &Frame) -> AggregateDelta {
        if self.aggregate.status.is_terminal() {
            return AggregateDelta::Ignored;
        }

        match frame {
            Frame::Thinking(step) => {
                self.aggregate.thinking_trace.push(step.clone());
                AggregateDelta::ThinkingAppended {
                    index: self.aggregate.thinking_trace.len() - 1,
                }
            }
            Frame::Answer(text) => {
                self.aggregate.answer_text.push_str(text);
                AggregateDelta::AnswerAppended {
                    appended: text.len(),
                    total: self.aggregate.answer_text.len(),
                }
            }
            Frame::Sources(candidates) => self.merge_sources(candidates),
            Frame::Done(payload) => {
                let final_trace = payload.thinking_trace.is_some();
                self.aggregate.final_thinking_trace = payload.thinking_trace.clone();
                self.aggregate.status = AggregateStatus::Completed;
                AggregateDelta::Completed { final_trace }
            }
            Frame::Error(_) => {
                self.aggregate.status = AggregateStatus::Aborted;
                AggregateDelta::Aborted {
                    message: frame.error_message().unwrap_or_default(),
                }
            }
        }
    }

    fn merge_sources(&mut self, candidates: &[SourceCandidate]) -> AggregateDelta {
        let (mut added, mut duplicates, mut skipped) = (0, 0, 0);
        for candidate in candidates {
            let Some(url) = candidate.url.as_deref().filter(|u| !u.is_empty()) else {
                skipped += 1;
                continue;
            };
            if self.seen_urls.insert(url.to_string()) {
                self.aggregate.source_candidates.push(candidate.clone());
                added += 1;
            } else {
                duplicates += 1;
            }
        }
        AggregateDelta::SourcesMerged {
            added,
            duplicates,
            skipped,
        }
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> AggregateStatus {
        self.aggregate.status
    }

    /// Copy of the current aggregate
    #[must_use]
    pub fn snapshot(&self) -> Aggregate {
        self.aggregate.clone()
    }

    /// Consume the aggregator, yielding the aggregate
    #[must_use]
    pub fn into_aggregate(self) -> Aggregate {
        self.aggregate
    }
}
