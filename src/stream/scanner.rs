//! Incremental frame scanner
//!
//! Pulls exactly one frame off a [`ChunkSource`], asking the source for no
//! more than the frame still needs. Bytes that arrive past the frame end are
//! kept and handed to the [`Continuation`] together with the source.

use crate::constants::SCAN_BUFFER_SIZE;
use crate::error::ProxyError;
use crate::protocol::frame::{encoded_len, parse_header, HEADER_LEN};
use crate::stream::{next_chunk, ChunkSource, Continuation};
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    AwaitingHeader,
    AwaitingBody { body_len: usize },
    Done,
    Failed,
}

/// A completed frame body and whatever followed it in the same chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scanned {
    pub body: Bytes,
    pub remaining: Bytes,
}

/// Synchronous core of the scanner: feed chunks, get a frame out.
#[derive(Debug)]
pub struct FrameScanner {
    buf: BytesMut,
    state: ScanState,
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScanner {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(SCAN_BUFFER_SIZE),
            state: ScanState::AwaitingHeader,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// How many more bytes complete the current stage.
    pub fn wanted(&self) -> usize {
        match self.state {
            ScanState::AwaitingHeader => HEADER_LEN - self.buf.len(),
            ScanState::AwaitingBody { body_len } => encoded_len(body_len) - self.buf.len(),
            ScanState::Done | ScanState::Failed => 0,
        }
    }

    /// Append a chunk. Returns the frame once its last byte has arrived.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Scanned>, ProxyError> {
        if matches!(self.state, ScanState::Done | ScanState::Failed) {
            return Err(ProxyError::Frame(format!(
                "Scanner is already {:?}",
                self.state
            )));
        }

        let before = self.buf.len();
        self.buf.extend_from_slice(chunk);
        let after = self.buf.len();
        trace!("Scanner buffered {} -> {} bytes", before, after);

        // One chunk may cross the header and the body boundary at once.
        if self.state == ScanState::AwaitingHeader && crosses(before, after, HEADER_LEN) {
            match parse_header(&self.buf[..HEADER_LEN]) {
                Ok(body_len) => self.state = ScanState::AwaitingBody { body_len },
                Err(e) => {
                    self.state = ScanState::Failed;
                    return Err(e);
                }
            }
        }

        if let ScanState::AwaitingBody { body_len } = self.state {
            let end = encoded_len(body_len);
            if crosses(before, after, end) {
                let mut frame = self.buf.split_to(end);
                let body = frame.split_off(HEADER_LEN).freeze();
                let remaining = self.buf.split().freeze();
                self.state = ScanState::Done;
                debug!(
                    "Frame resolved, body_len={}, remaining={}",
                    body.len(),
                    remaining.len()
                );
                return Ok(Some(Scanned { body, remaining }));
            }
        }

        Ok(None)
    }

    /// The source ended before the frame completed.
    pub fn premature_end(&mut self) -> ProxyError {
        let expected = match self.state {
            ScanState::AwaitingBody { body_len } => encoded_len(body_len),
            _ => HEADER_LEN,
        };
        self.state = ScanState::Failed;
        ProxyError::PrematureEnd {
            received: self.buf.len(),
            expected,
        }
    }
}

/// Whether `boundary` lies in `(before, after]`.
fn crosses(before: usize, after: usize, boundary: usize) -> bool {
    before < boundary && boundary <= after
}

/// Read one frame from `source` and return its body plus a continuation
/// over everything after it.
pub async fn scan<S: ChunkSource>(mut source: S) -> Result<(Bytes, Continuation<S>), ProxyError> {
    let mut scanner = FrameScanner::new();
    loop {
        let wanted = scanner.wanted();
        match next_chunk(&mut source, wanted).await {
            Some(Ok(chunk)) => {
                if let Some(scanned) = scanner.push(&chunk)? {
                    let ended = source.is_exhausted();
                    return Ok((
                        scanned.body,
                        Continuation::new(scanned.remaining, source, ended),
                    ));
                }
            }
            Some(Err(e)) => {
                scanner.state = ScanState::Failed;
                return Err(ProxyError::Io(e));
            }
            None => return Err(scanner.premature_end()),
        }
    }
}
