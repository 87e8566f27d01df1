//! Prefix continuation
//!
//! What is left of a stream after its leading frame: the bytes that were
//! already buffered past the frame, and the source itself. It can be used
//! exactly once, either by draining everything into a sink or by taking the
//! parts out. Any later attempt fails without touching the source or a sink.

use crate::error::ProxyError;
use crate::gate::OnceGate;
use crate::stream::{empty_body, ChunkSink, ChunkSource, ProxyBody, RelayPipe};
use bytes::Bytes;
use std::fmt;
use std::sync::Mutex;
use tracing::trace;

/// The parts of a consumed continuation
pub struct Remainder<S> {
    /// Bytes read past the frame boundary, to be delivered first
    pub remaining: Bytes,
    pub source: S,
    /// The source had already ended when the frame completed
    pub source_ended: bool,
}

pub struct Continuation<S> {
    gate: OnceGate,
    remaining_len: usize,
    source_ended: bool,
    parts: Mutex<Option<(Bytes, S)>>,
}

impl<S> fmt::Debug for Continuation<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("remaining_len", &self.remaining_len)
            .field("source_ended", &self.source_ended)
            .field("consumed", &self.gate.is_fired())
            .finish()
    }
}

impl<S: ChunkSource> Continuation<S> {
    pub(crate) fn new(remaining: Bytes, source: S, source_ended: bool) -> Self {
        Self {
            gate: OnceGate::new(),
            remaining_len: remaining.len(),
            source_ended,
            parts: Mutex::new(Some((remaining, source))),
        }
    }

    pub fn remaining_len(&self) -> usize {
        self.remaining_len
    }

    /// Nothing follows the frame except the already buffered bytes.
    pub fn is_source_ended(&self) -> bool {
        self.source_ended
    }

    pub fn is_consumed(&self) -> bool {
        self.gate.is_fired()
    }

    fn take(&self) -> Result<(Bytes, S), ProxyError> {
        if !self.gate.try_fire() {
            return Err(ProxyError::ContinuationReused);
        }
        self.parts
            .lock()
            .ok()
            .and_then(|mut parts| parts.take())
            .ok_or(ProxyError::ContinuationReused)
    }

    /// Deliver the buffered bytes, then the rest of the source, into `sink`.
    pub async fn drain_into<K: ChunkSink>(
        &self,
        sink: &mut K,
        pipe: &RelayPipe,
    ) -> Result<u64, ProxyError> {
        let (remaining, mut source) = self.take()?;
        trace!(
            "Draining continuation, remaining={}, source_ended={}",
            remaining.len(),
            self.source_ended
        );
        pipe.copy_with_prefix(remaining, &mut source, self.source_ended, sink)
            .await
    }

    /// Hand the buffered bytes and the source to the caller.
    pub fn take_remainder(&self) -> Result<Remainder<S>, ProxyError> {
        let (remaining, source) = self.take()?;
        Ok(Remainder {
            remaining,
            source,
            source_ended: self.source_ended,
        })
    }
}

impl<S: ChunkSource + 'static> Continuation<S> {
    /// Turn what follows the frame into a streaming HTTP body.
    pub fn into_body(self, pipe: RelayPipe) -> Result<ProxyBody, ProxyError> {
        let Remainder {
            remaining,
            source,
            source_ended,
        } = self.take_remainder()?;
        if source_ended && remaining.is_empty() {
            return Ok(empty_body());
        }
        Ok(pipe.spawn_body(remaining, source, source_ended))
    }
}
