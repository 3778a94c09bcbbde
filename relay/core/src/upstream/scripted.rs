//! Scripted Research Agent
//!
//! In-process agent that replays a fixed script of byte chunks. Used by the
//! test suites and handy for exercising a relay without a live agent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{ChunkStream, ResearchAgent};
use crate::error::AbortReason;
use crate::messages::QueryRequest;

/// One step of a scripted response body
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Yield these bytes as one chunk
    Chunk(Vec<u8>),
    /// Wait before the next step
    Delay(Duration),
    /// Fail the body read
    Fail(String),
    /// Never yield again
    Hang,
}

#[derive(Clone, Debug)]
enum Response {
    Stream(Vec<ScriptStep>),
    Refuse(String),
    HangBeforeResponse,
}

/// [`ResearchAgent`] that replays a script
///
/// Every `open_stream` call replays the same script from the start.
#[derive(Debug)]
pub struct ScriptedAgent {
    response: Response,
    requests: Mutex<Vec<QueryRequest>>,
    open_streams: Arc<AtomicUsize>,
}

/// Decrements the open-stream count when the body is dropped
struct OpenStreamGuard(Arc<AtomicUsize>);

impl Drop for OpenStreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedAgent {
    fn with_response(response: Response) -> Self {
        Self {
            response,
            requests: Mutex::new(Vec::new()),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replay `steps` as the response body
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::with_response(Response::Stream(steps))
    }

    /// Replay `body` cut into chunks of `chunk_size` bytes
    ///
    /// Cuts ignore line and character boundaries.
    #[must_use]
    pub fn chunked(body: &[u8], chunk_size: usize) -> Self {
        let steps = body
            .chunks(chunk_size.max(1))
            .map(|chunk| ScriptStep::Chunk(chunk.to_vec()))
            .collect();
        Self::new(steps)
    }

    /// Build a body from JSON frame payloads, one `data: ` line each
    #[must_use]
    pub fn from_frames<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let steps = frames
            .into_iter()
            .map(|json| ScriptStep::Chunk(format!("data: {}\n\n", json.as_ref()).into_bytes()))
            .collect();
        Self::new(steps)
    }

    /// Refuse every query before the body starts
    #[must_use]
    pub fn refusing(message: impl Into<String>) -> Self {
        Self::with_response(Response::Refuse(message.into()))
    }

    /// Never answer a query
    #[must_use]
    pub fn unresponsive() -> Self {
        Self::with_response(Response::HangBeforeResponse)
    }

    /// Requests received so far
    #[must_use]
    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().clone()
    }

    /// Response bodies handed out and not yet dropped
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResearchAgent for ScriptedAgent {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn health_check(&self) -> bool {
        !matches!(self.response, Response::Refuse(_))
    }

    async fn open_stream(&self, request: &QueryRequest) -> Result<ChunkStream, AbortReason> {
        self.requests.lock().push(request.clone());

        let steps = match &self.response {
            Response::Stream(steps) => steps.clone(),
            Response::Refuse(message) => {
                return Err(AbortReason::UpstreamUnavailable(message.clone()))
            }
            Response::HangBeforeResponse => futures::future::pending().await,
        };

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let guard = OpenStreamGuard(Arc::clone(&self.open_streams));

        let stream = futures::stream::unfold(
            (steps.into_iter(), guard),
            |(mut steps, guard)| async move {
                loop {
                    let Some(step) = steps.next() else {
                        return None;
                    };
                    match step {
                        ScriptStep::Chunk(bytes) => return Some((Ok(bytes), (steps, guard))),
                        ScriptStep::Delay(delay) => tokio::time::sleep(delay).await,
                        ScriptStep::Fail(message) => {
                            let err = AbortReason::UpstreamUnavailable(message);
                            return Some((Err(err), (steps, guard)));
                        }
                        ScriptStep::Hang => futures::future::pending::<()>().await,
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}
