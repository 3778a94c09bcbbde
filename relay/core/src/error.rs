//! Failure taxonomy and recovery policy
//!
//! Every stage reports failures as typed values. [`classify`] decides, once
//! per kind, whether a failure is recovered in place, ends the query with a
//! message to the client, or ends it silently.

use std::time::Duration;

use thiserror::Error;

use crate::frame::FrameError;

/// Default number of consecutive malformed lines tolerated
pub const DEFAULT_MAX_CONSECUTIVE_PROTOCOL_ERRORS: u32 = 3;

/// Why a query ended without completing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    /// Connection refused, non-success status, or closed before a terminal frame
    #[error("research agent unavailable: {0}")]
    UpstreamUnavailable(String),

    /// No chunk arrived within the stall bound
    #[error("research agent sent nothing for {}s", .0.as_secs())]
    UpstreamTimeout(Duration),

    /// The agent emitted an `error` frame
    #[error("research agent reported an error: {0}")]
    UpstreamReported(String),

    /// The client went away
    #[error("client disconnected")]
    ClientDisconnected,

    /// The client did not drain its outbound queue in time
    #[error("client is not keeping up with the event stream")]
    ClientTooSlow,

    /// A write to the store failed
    #[error("failed to save research results: {0}")]
    PersistenceFailure(String),
}

impl AbortReason {
    /// The taxonomy kind of this reason
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            Self::UpstreamTimeout(_) => ErrorKind::UpstreamTimeout,
            Self::UpstreamReported(_) => ErrorKind::UpstreamReported,
            Self::ClientDisconnected => ErrorKind::ClientDisconnected,
            Self::ClientTooSlow => ErrorKind::ClientTooSlow,
            Self::PersistenceFailure(_) => ErrorKind::PersistenceFailure,
        }
    }

    /// What to do about this reason
    #[must_use]
    pub fn disposition(&self) -> Disposition {
        classify(self.kind())
    }

    /// Message shown to the client in `research_error`
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::UpstreamUnavailable(_) => {
                "The research service is unavailable. Please try again.".to_string()
            }
            Self::UpstreamTimeout(_) => {
                "The research service stopped responding. Please try again.".to_string()
            }
            Self::UpstreamReported(message) => format!("Research failed: {message}"),
            Self::ClientDisconnected => "Connection closed".to_string(),
            Self::ClientTooSlow => {
                "Research stopped because events could not be delivered fast enough.".to_string()
            }
            Self::PersistenceFailure(_) => {
                "The research answer could not be saved.".to_string()
            }
        }
    }
}

/// Failure kinds, including ones that never abort a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`AbortReason::UpstreamUnavailable`]
    UpstreamUnavailable,
    /// See [`AbortReason::UpstreamTimeout`]
    UpstreamTimeout,
    /// A single `data: ` line failed to decode
    UpstreamProtocolError,
    /// See [`AbortReason::UpstreamReported`]
    UpstreamReported,
    /// See [`AbortReason::ClientDisconnected`]
    ClientDisconnected,
    /// See [`AbortReason::ClientTooSlow`]
    ClientTooSlow,
    /// See [`AbortReason::PersistenceFailure`]
    PersistenceFailure,
}

/// Handling decided for a failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Skip the offending unit and keep going
    RecoverLocally,
    /// End the query and tell the client
    AbortAndReport,
    /// End the query; the client is unreachable
    AbortSilently,
}

/// Recovery policy, one decision per kind
#[must_use]
pub fn classify(kind: ErrorKind) -> Disposition {
    match kind {
        ErrorKind::UpstreamProtocolError => Disposition::RecoverLocally,
        ErrorKind::ClientDisconnected => Disposition::AbortSilently,
        ErrorKind::UpstreamUnavailable
        | ErrorKind::UpstreamTimeout
        | ErrorKind::UpstreamReported
        | ErrorKind::ClientTooSlow
        | ErrorKind::PersistenceFailure => Disposition::AbortAndReport,
    }
}

/// Counts consecutive malformed lines and escalates past a threshold
#[derive(Debug, Clone)]
pub struct ProtocolErrorBudget {
    max_consecutive: u32,
    consecutive: u32,
    total: u64,
}

impl Default for ProtocolErrorBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONSECUTIVE_PROTOCOL_ERRORS)
    }
}

impl ProtocolErrorBudget {
    /// Tolerate up to `max_consecutive` malformed lines in a row
    #[must_use]
    pub fn new(max_consecutive: u32) -> Self {
        Self {
            max_consecutive,
            consecutive: 0,
            total: 0,
        }
    }

    /// Record a good frame
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Record a malformed line
    ///
    /// # Errors
    ///
    /// Returns `AbortReason::UpstreamUnavailable` once the run of consecutive
    /// errors exceeds the threshold.
    pub fn record_error(&mut self, error: &FrameError) -> Result<(), AbortReason> {
        self.consecutive += 1;
        self.total += 1;
        if self.consecutive > self.max_consecutive {
            return Err(AbortReason::UpstreamUnavailable(format!(
                "{} consecutive malformed frames, last: {error}",
                self.consecutive
            )));
        }
        Ok(())
    }

    /// Total malformed lines seen
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }
}
