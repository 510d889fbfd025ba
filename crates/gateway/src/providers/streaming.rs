//! Incremental response plumbing shared by the HTTP adapters: server-sent
//! event framing, the native chunk stream with idle timeout, and simulated
//! word-by-word streaming used when the native channel is unavailable.

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChunkStream, GenerateResponse, StreamChunk};
use crate::config::ProviderKind;
use crate::error::ProviderError;

/// What one SSE `data:` payload means for the stream
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SseEvent {
    Delta(String),
    Done,
    Error(String),
    Skip,
}

/// Splits a byte stream into complete SSE `data:` payloads.
///
/// Bytes are held until a full line arrives, so multi-byte characters split
/// across network reads are decoded intact.
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    pending: Vec<u8>,
}

impl SseBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
        }
        payloads
    }
}

/// Split text into word pieces that keep their trailing whitespace, so the
/// pieces concatenate back into the original.
fn word_pieces(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut in_space = false;
    for (i, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_space = true;
        } else if in_space {
            pieces.push(&text[start..i]);
            start = i;
            in_space = false;
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Word-by-word chunks for the part of `content` after `already_emitted`.
/// Always ends with a `done` chunk.
///
/// Returns `None` when `content` does not extend `already_emitted`: text the
/// caller has already seen cannot be taken back.
pub fn resume_chunks(content: &str, already_emitted: &str) -> Option<Vec<StreamChunk>> {
    let rest = content.strip_prefix(already_emitted)?;
    let mut cumulative = already_emitted.to_string();

    let mut chunks = Vec::new();
    for piece in word_pieces(rest) {
        cumulative.push_str(piece);
        chunks.push(StreamChunk::partial(&cumulative, piece));
    }
    chunks.push(StreamChunk::finished(&cumulative));
    Some(chunks)
}

/// Re-emit a complete response as a word-by-word stream
pub fn simulate_stream(content: String, cancel: CancellationToken) -> ChunkStream {
    let chunks: VecDeque<StreamChunk> = resume_chunks(&content, "").unwrap_or_default().into();
    Box::pin(stream::unfold(
        (chunks, cancel, false),
        |(mut chunks, cancel, stopped)| async move {
            if stopped {
                return None;
            }
            if cancel.is_cancelled() {
                return Some((Err(ProviderError::Cancelled), (chunks, cancel, true)));
            }
            let chunk = chunks.pop_front()?;
            Some((Ok(chunk), (chunks, cancel, false)))
        },
    ))
}

pub(crate) type FallbackRequest =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<GenerateResponse, ProviderError>> + Send>;

struct NativeState {
    provider: ProviderKind,
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: SseBuffer,
    parse: fn(&str) -> SseEvent,
    queue: VecDeque<StreamChunk>,
    emitted: String,
    idle_timeout: Duration,
    fallback_timeout: Duration,
    cancel: CancellationToken,
    fallback: Option<FallbackRequest>,
    finished: bool,
}

impl NativeState {
    /// Swap to one blocking request and re-emit what is still missing
    async fn fall_back(&mut self, reason: &str) -> Result<(), ProviderError> {
        self.finished = true;
        let Some(request) = self.fallback.take() else {
            return Err(ProviderError::Transient {
                provider: self.provider,
                message: format!("stream interrupted: {}", reason),
            });
        };
        warn!(
            provider = %self.provider,
            emitted_chars = self.emitted.len(),
            "⚠️ Native stream failed ({}), switching to simulated streaming",
            reason
        );
        let response = match tokio::time::timeout(self.fallback_timeout, request()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(provider = %self.provider, "⏰ Fallback request timed out after {:?}", self.fallback_timeout);
                return Err(ProviderError::Timeout {
                    provider: self.provider,
                    after: self.fallback_timeout,
                });
            }
        };

        match resume_chunks(&response.content, &self.emitted) {
            Some(chunks) => {
                self.queue.extend(chunks);
                Ok(())
            }
            None => {
                warn!(
                    provider = %self.provider,
                    emitted_chars = self.emitted.len(),
                    "❌ Fallback response does not continue the streamed text"
                );
                Err(ProviderError::Transient {
                    provider: self.provider,
                    message: format!(
                        "stream interrupted after {} chars ({}); fallback response diverged",
                        self.emitted.len(),
                        reason
                    ),
                })
            }
        }
    }

    fn absorb(&mut self, bytes: &[u8]) -> Option<String> {
        for payload in self.buffer.push(bytes) {
            match (self.parse)(&payload) {
                SseEvent::Delta(delta) if !delta.is_empty() => {
                    self.emitted.push_str(&delta);
                    self.queue.push_back(StreamChunk::partial(&self.emitted, &delta));
                }
                SseEvent::Done => {
                    self.queue.push_back(StreamChunk::finished(&self.emitted));
                    self.finished = true;
                    return None;
                }
                SseEvent::Error(message) => return Some(message),
                SseEvent::Delta(_) | SseEvent::Skip => {}
            }
        }
        None
    }
}

/// Chunk stream over an SSE response body.
///
/// Every read is bounded by `idle_timeout`. A stalled read, transport
/// error, vendor error event or a body that ends without its terminal
/// event triggers `fallback` once, bounded by `fallback_timeout`.
pub(crate) fn native_stream(
    provider: ProviderKind,
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    parse: fn(&str) -> SseEvent,
    idle_timeout: Duration,
    fallback_timeout: Duration,
    cancel: CancellationToken,
    fallback: FallbackRequest,
) -> ChunkStream {
    let state = NativeState {
        provider,
        bytes,
        buffer: SseBuffer::default(),
        parse,
        queue: VecDeque::new(),
        emitted: String::new(),
        idle_timeout,
        fallback_timeout,
        cancel,
        fallback: Some(fallback),
        finished: false,
    };

    Box::pin(stream::unfold(Some(state), |state| async move {
        let mut st = state?;
        loop {
            if let Some(chunk) = st.queue.pop_front() {
                return Some((Ok(chunk), Some(st)));
            }
            if st.finished {
                return None;
            }

            let next = tokio::select! {
                _ = st.cancel.cancelled() => None,
                read = tokio::time::timeout(st.idle_timeout, st.bytes.next()) => Some(read),
            };

            let failure = match next {
                None => {
                    debug!(provider = %st.provider, "Stream cancelled by caller");
                    return Some((Err(ProviderError::Cancelled), None));
                }
                Some(Ok(Some(Ok(bytes)))) => st.absorb(&bytes),
                Some(Ok(Some(Err(e)))) => Some(e.to_string()),
                Some(Ok(None)) => Some("body ended before completion event".to_string()),
                Some(Err(_)) => Some(format!("no data for {:?}", st.idle_timeout)),
            };

            if let Some(reason) = failure {
                if let Err(e) = st.fall_back(&reason).await {
                    return Some((Err(e), None));
                }
            }
        }
    }))
}
