//! Relay Core - Research Streaming Orchestration
//!
//! Sits between client surfaces and an external research agent. For each
//! query the relay opens the agent's streaming endpoint, decodes the framed
//! byte stream, forwards every frame to the client as it arrives, accumulates
//! the answer, and persists the conversation turn once the agent finishes.
//!
//! # Architecture
//!
//! ```text
//!  client ──research──▶ ConnectionManager ──▶ PersistenceCoordinator::begin_turn
//!                              │
//!                              ▼
//!                        StreamRelay ◀──bytes── ResearchAgent (HTTP)
//!                        │        │
//!                FrameDecoder   Aggregator
//!                        │        │
//!  client ◀──research_event──┘        └──▶ PersistenceCoordinator::finalize ──▶ TurnStore
//! ```
//!
//! # Key Types
//!
//! - [`FrameDecoder`]: chunk-boundary-independent `data: ` line decoder
//! - [`Aggregator`]: per-query answer, trace and source accumulation
//! - [`StreamRelay`]: drives one agent stream to a [`FrameSink`]
//! - [`PersistenceCoordinator`]: user/assistant turns and sources
//! - [`ConnectionManager`]: one client connection, one query at a time
//! - [`TurnStore`]: storage seam with memory and SQLite backends
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{
//!     ConnectionManager, HttpResearchAgent, MemoryStore, PersistenceCoordinator,
//!     QueryRequest, RelayContext, StreamRelay,
//! };
//!
//! let config = relay_core::config::load_config()?;
//! let agent = HttpResearchAgent::new(&config.agent_url, config.connect_timeout)?;
//! let context = RelayContext {
//!     relay: Arc::new(StreamRelay::new(Arc::new(agent), config.relay_settings())),
//!     persistence: PersistenceCoordinator::new(Arc::new(MemoryStore::new())),
//!     settings: config.connection_settings(),
//! };
//!
//! let (connection, mut outbound) = ConnectionManager::new(context);
//! connection.submit(QueryRequest::new("What moved oil prices?", "thread-1", "user-1"))?;
//! while let Some(message) = outbound.recv().await {
//!     println!("{}", message.to_json()?);
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod lifecycle;
pub mod messages;
pub mod persistence;
pub mod relay;
pub mod store;
pub mod upstream;

pub use aggregate::{Aggregate, AggregateDelta, AggregateStatus, Aggregator};
pub use config::{ConfigError, ConfigOverrides, ConfigSource, RelayConfigFile, StorageBackend};
pub use connection::{
    ConnectionId, ConnectionManager, ConnectionSettings, QueryResult, RelayContext, SubmitError,
};
pub use error::{classify, AbortReason, Disposition, ErrorKind, ProtocolErrorBudget};
pub use frame::{DonePayload, Frame, FrameDecoder, FrameError, FrameKind, SourceCandidate};
pub use lifecycle::{LifecycleError, QueryLifecycle, QueryState};
pub use messages::{ClientMessage, QueryRequest, RequestError, ServerMessage};
pub use persistence::{FinalizeReport, PersistenceCoordinator};
pub use relay::{
    cancel_pair, CancelHandle, CancelSignal, FrameSink, RelaySettings, StreamRelay,
    TerminalOutcome,
};
pub use store::{MemoryStore, SqliteStore, StoreError, TurnStore};
pub use upstream::{HttpResearchAgent, ResearchAgent};
#[cfg(any(test, feature = "test-util"))]
pub use upstream::ScriptedAgent;
