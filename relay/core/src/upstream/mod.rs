//! Research Agent Integration
//!
//! The relay reaches the external research agent through the
//! [`ResearchAgent`] trait, which hides transport details behind a stream of
//! raw byte chunks.
//!
//! # Available Agents
//!
//! - [`HttpResearchAgent`]: the agent's HTTP streaming endpoint (default)
//! - `ScriptedAgent`: in-process replay of a fixed byte script, for tests
//!   (feature `test-util`)
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::upstream::{HttpResearchAgent, ResearchAgent};
//!
//! let agent = HttpResearchAgent::new("http://localhost:8001", Duration::from_secs(10))?;
//! let chunks = agent.open_stream(&request).await?;
//! ```

mod http;
#[cfg(any(test, feature = "test-util"))]
mod scripted;
mod traits;

pub use http::{HttpResearchAgent, DEFAULT_AGENT_URL};
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{ScriptStep, ScriptedAgent};
pub use traits::{ChunkStream, ResearchAgent};
