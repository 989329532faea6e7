//! Server-sent-event streaming: line decoding, delta accumulation and the
//! session driver that guards a stream with an overall deadline, an
//! inactivity watchdog and an abort handle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::AiError;
use crate::openrouter::types::StreamChunk;
use crate::traits::{ChunkCallback, StreamCompletion, StreamEnd, StreamOutcome, StreamProgress};

// =============================================================================
// Limits
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    /// Hard ceiling on the whole session.
    pub overall: Duration,
    /// Window after the last chunk before the stream counts as stalled.
    pub inactivity: Duration,
    /// Consecutive empty chunks treated as an implicit end of stream.
    pub max_empty_chunks: usize,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            overall: Duration::from_secs(90),
            inactivity: Duration::from_secs(30),
            max_empty_chunks: 3,
        }
    }
}

// =============================================================================
// SSE line decoder
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into `data:` payloads. Partial lines are held until
/// the rest arrives, so frames may straddle network chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Whether part of a line is waiting for its newline.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Flush whatever is left once the connection closes.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(payload.to_string()))
    }
}

// =============================================================================
// Accumulator
// =============================================================================

#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    reasoning: String,
    generation_id: Option<String>,
}

impl StreamAccumulator {
    /// Fold one frame into the running totals. Returns the content delta when
    /// the frame carried any content or reasoning.
    fn apply(&mut self, chunk: StreamChunk) -> Option<String> {
        if self.generation_id.is_none() {
            self.generation_id = chunk.id;
        }
        let delta = chunk.choices.into_iter().next()?.delta;
        let content = delta.content.unwrap_or_default();
        let reasoning = delta.reasoning.unwrap_or_default();
        if content.is_empty() && reasoning.is_empty() {
            return None;
        }
        self.content.push_str(&content);
        self.reasoning.push_str(&reasoning);
        Some(content)
    }

    fn finish(self, end: StreamEnd) -> StreamCompletion {
        StreamCompletion {
            content: self.content,
            reasoning: self.reasoning,
            generation_id: self.generation_id,
            end,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Cancels a streaming session. Cheap to clone; aborting twice is harmless.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// One in-flight streaming request. The outcome channel is written exactly
/// once, whichever way the stream ends.
pub struct StreamingSession {
    abort: AbortHandle,
    outcome: oneshot::Receiver<StreamOutcome>,
}

impl StreamingSession {
    /// Drive `connect`'s byte stream on a background task.
    pub fn spawn<C, S>(connect: C, on_chunk: ChunkCallback, limits: StreamLimits) -> Self
    where
        C: Future<Output = Result<S, AiError>> + Send + 'static,
        S: Stream<Item = Result<Bytes, AiError>> + Send + 'static,
    {
        let (abort_tx, abort_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = drive(connect, on_chunk, limits, abort_rx).await;
            let _ = outcome_tx.send(outcome);
        });

        Self {
            abort: AbortHandle {
                tx: Arc::new(abort_tx),
            },
            outcome: outcome_rx,
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Wait for the terminal outcome.
    pub async fn finish(self) -> StreamOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => Err(AiError::Network(
                "stream task ended without reporting an outcome".to_string(),
            )),
        }
    }
}

async fn aborted(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|aborted| *aborted).await.is_err() {
        // Every handle dropped without aborting: never fires.
        std::future::pending::<()>().await;
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn drive<C, S>(
    connect: C,
    mut on_chunk: ChunkCallback,
    limits: StreamLimits,
    mut abort: watch::Receiver<bool>,
) -> StreamOutcome
where
    C: Future<Output = Result<S, AiError>> + Send,
    S: Stream<Item = Result<Bytes, AiError>> + Send,
{
    let overall = tokio::time::sleep(limits.overall);
    tokio::pin!(overall);
    let mut acc = StreamAccumulator::default();

    let stream = tokio::select! {
        biased;
        _ = aborted(&mut abort) => return Ok(acc.finish(StreamEnd::Aborted)),
        _ = &mut overall => {
            return Err(AiError::Timeout(format!(
                "no response within {}ms",
                limits.overall.as_millis()
            )))
        }
        connected = connect => connected?,
    };
    let mut stream = Box::pin(stream);

    let mut decoder = SseDecoder::default();
    let mut empty_run = 0usize;
    let mut idle_deadline = Some(Instant::now() + limits.inactivity);

    loop {
        tokio::select! {
            biased;
            _ = aborted(&mut abort) => {
                debug!("Stream aborted");
                return Ok(acc.finish(StreamEnd::Aborted));
            }
            _ = &mut overall => {
                warn!(received = acc.content.len(), "Stream exceeded overall timeout");
                return Err(AiError::Timeout(format!(
                    "stream did not finish within {}ms",
                    limits.overall.as_millis()
                )));
            }
            _ = idle(idle_deadline) => {
                warn!(
                    received = acc.content.len(),
                    window_ms = limits.inactivity.as_millis() as u64,
                    "Stream stalled, completing with partial result"
                );
                return Ok(acc.finish(StreamEnd::Idle));
            }
            next = stream.next() => {
                let bytes = match next {
                    None => {
                        if let Some(SseEvent::Data(payload)) = decoder.finish() {
                            apply_payload(&mut acc, &payload, &mut on_chunk);
                        }
                        return Ok(acc.finish(StreamEnd::Closed));
                    }
                    Some(Err(e)) => return Err(e),
                    Some(Ok(bytes)) => bytes,
                };

                idle_deadline = Some(Instant::now() + limits.inactivity);

                // A bare newline may be the tail of a buffered frame.
                if !decoder.has_partial() && bytes.iter().all(u8::is_ascii_whitespace) {
                    empty_run += 1;
                    if empty_run >= limits.max_empty_chunks {
                        debug!(empty_run, "Consecutive empty chunks, treating as end of stream");
                        return Ok(acc.finish(StreamEnd::EmptyChunks));
                    }
                    continue;
                }
                empty_run = 0;

                for event in decoder.push(&bytes) {
                    match event {
                        SseEvent::Done => return Ok(acc.finish(StreamEnd::Done)),
                        SseEvent::Data(payload) => {
                            apply_payload(&mut acc, &payload, &mut on_chunk)
                        }
                    }
                }
            }
        }
    }
}

fn apply_payload(acc: &mut StreamAccumulator, payload: &str, on_chunk: &mut ChunkCallback) {
    let chunk: StreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(error = %e, "Skipping malformed stream frame");
            return;
        }
    };
    if let Some(delta) = acc.apply(chunk) {
        on_chunk(StreamProgress {
            content: &acc.content,
            reasoning: &acc.reasoning,
            delta: &delta,
        });
    }
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod stream_tests;
