//! Research Agent Traits
//!
//! Trait definitions for upstream research agents. The relay only needs two
//! things from an agent: a liveness probe and a byte stream for a query.
//! Framing, decoding and aggregation happen above this layer, so an
//! implementation never interprets the bytes it yields.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::AbortReason;
use crate::messages::QueryRequest;

/// Raw response body, chunked however the transport delivers it
///
/// An `Err` item ends the stream; the relay stops reading after it.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, AbortReason>> + Send>>;

/// Upstream research agent
///
/// Implement this trait to add support for a different agent transport.
#[async_trait]
pub trait ResearchAgent: Send + Sync {
    /// Get the agent name (e.g., "http")
    fn name(&self) -> &str;

    /// Check if the agent is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Start a research query and return its response body
    ///
    /// Resolves once the agent has accepted the request. Connection failures
    /// and non-success responses are reported as
    /// `AbortReason::UpstreamUnavailable` before any chunk is produced.
    async fn open_stream(&self, request: &QueryRequest) -> Result<ChunkStream, AbortReason>;
}
