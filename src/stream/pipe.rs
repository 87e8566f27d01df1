//! Relay pipe
//!
//! Copies a [`ChunkSource`] into a [`ChunkSink`] one chunk at a time. The next
//! chunk is only pulled after the sink accepted the previous one, so a slow
//! sink slows the source down instead of growing a buffer.

use crate::constants::{BODY_CHANNEL_SIZE, DEFAULT_BUFFER_SIZE};
use crate::error::ProxyError;
use crate::metrics::StreamMeter;
use crate::stream::{body_channel, next_chunk, ChunkSink, ChunkSource, ProxyBody};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tracing::{debug, trace, Instrument};

/// Copy policy: whether to close the sink afterwards, and what to count
#[derive(Debug, Clone)]
pub struct RelayPipe {
    end_on_success: bool,
    end_on_failure: bool,
    meter: Option<Arc<StreamMeter>>,
}

impl Default for RelayPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayPipe {
    /// Closes the sink on success and on failure.
    pub fn new() -> Self {
        Self {
            end_on_success: true,
            end_on_failure: true,
            meter: None,
        }
    }

    pub fn end_on_success(mut self, end: bool) -> Self {
        self.end_on_success = end;
        self
    }

    pub fn end_on_failure(mut self, end: bool) -> Self {
        self.end_on_failure = end;
        self
    }

    pub fn end_on_complete(self, end: bool) -> Self {
        self.end_on_success(end).end_on_failure(end)
    }

    pub fn metered(mut self, meter: Arc<StreamMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    /// Copy `source` into `sink` until the source ends. Returns bytes copied.
    pub async fn copy<S, K>(&self, source: &mut S, sink: &mut K) -> Result<u64, ProxyError>
    where
        S: ChunkSource + ?Sized,
        K: ChunkSink,
    {
        self.copy_with_prefix(Bytes::new(), source, false, sink)
            .await
    }

    /// Write `prefix` first, then the rest of `source` unless it already ended.
    pub async fn copy_with_prefix<S, K>(
        &self,
        prefix: Bytes,
        source: &mut S,
        source_ended: bool,
        sink: &mut K,
    ) -> Result<u64, ProxyError>
    where
        S: ChunkSource + ?Sized,
        K: ChunkSink,
    {
        if let Some(meter) = &self.meter {
            meter.pipe_opened();
        }

        let mut total = 0u64;
        if !prefix.is_empty() {
            total += self.forward(prefix, sink).await?;
        }

        if !source_ended {
            loop {
                match next_chunk(source, DEFAULT_BUFFER_SIZE).await {
                    Some(Ok(chunk)) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        total += self.forward(chunk, sink).await?;
                    }
                    Some(Err(e)) => {
                        self.close_after_failure(sink).await;
                        return Err(ProxyError::Io(e));
                    }
                    None => break,
                }
            }
        }

        if self.end_on_success {
            sink.finish().await.map_err(ProxyError::SinkWrite)?;
        }
        trace!("Pipe finished after {} bytes", total);
        Ok(total)
    }

    /// Relay `prefix` and then `source` into a streaming HTTP body.
    ///
    /// The copy runs on its own task; a failure aborts the body instead of
    /// ending it cleanly, so the peer sees a truncated message.
    pub fn into_body<S>(self, prefix: Bytes, source: S) -> ProxyBody
    where
        S: ChunkSource + 'static,
    {
        self.spawn_body(prefix, source, false)
    }

    pub(crate) fn spawn_body<S>(self, prefix: Bytes, mut source: S, source_ended: bool) -> ProxyBody
    where
        S: ChunkSource + 'static,
    {
        let (mut sink, body) = body_channel(BODY_CHANNEL_SIZE);
        let pipe = self.end_on_failure(false);
        tokio::spawn(
            async move {
                if let Err(e) = pipe
                    .copy_with_prefix(prefix, &mut source, source_ended, &mut sink)
                    .await
                {
                    debug!("Body relay failed: {}", e);
                    sink.abort(io::Error::other(e.to_string())).await;
                }
            }
            .in_current_span(),
        );
        body
    }

    async fn forward<K: ChunkSink>(&self, chunk: Bytes, sink: &mut K) -> Result<u64, ProxyError> {
        let len = chunk.len();
        if let Some(meter) = &self.meter {
            meter.record(len);
        }
        if let Err(e) = sink.write_chunk(chunk).await {
            self.close_after_failure(sink).await;
            return Err(ProxyError::SinkWrite(e));
        }
        Ok(len as u64)
    }

    async fn close_after_failure<K: ChunkSink>(&self, sink: &mut K) {
        if self.end_on_failure {
            let _ = sink.finish().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamSource;
    use futures_util::stream;
    use http_body_util::BodyExt;
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};
    use std::future::Future;
    use std::io;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    /// Sink that records writes and can fail after a number of chunks.
    #[derive(Default)]
    struct RecordingSink {
        data: Vec<u8>,
        writes: usize,
        finished: bool,
        fail_after: Option<usize>,
    }

    impl ChunkSink for RecordingSink {
        fn write_chunk(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send {
            let result = match self.fail_after {
                Some(limit) if self.writes >= limit => {
                    Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
                }
                _ => {
                    self.data.extend_from_slice(&chunk);
                    Ok(())
                }
            };
            self.writes += 1;
            std::future::ready(result)
        }

        fn finish(&mut self) -> impl Future<Output = io::Result<()>> + Send {
            self.finished = true;
            std::future::ready(Ok(()))
        }
    }

    fn source_of(
        chunks: &[&'static str],
    ) -> StreamSource<stream::Iter<std::vec::IntoIter<io::Result<Bytes>>>> {
        let chunks: Vec<io::Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        StreamSource::new(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_copy_in_order_and_finish() {
        let mut source = source_of(&["one ", "two ", "three"]);
        let mut sink = RecordingSink::default();
        let copied = RelayPipe::new().copy(&mut source, &mut sink).await.unwrap();
        assert_eq!(copied, 13);
        assert_eq!(sink.data, b"one two three");
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn test_end_on_success_disabled_keeps_sink_open() {
        let mut source = source_of(&["data"]);
        let mut sink = RecordingSink::default();
        RelayPipe::new()
            .end_on_success(false)
            .copy(&mut source, &mut sink)
            .await
            .unwrap();
        assert!(!sink.finished);
    }

    #[tokio::test]
    async fn test_sink_failure_is_reported() {
        let mut source = source_of(&["a", "b", "c"]);
        let mut sink = RecordingSink {
            fail_after: Some(1),
            ..Default::default()
        };
        let result = RelayPipe::new().copy(&mut source, &mut sink).await;
        assert!(matches!(result, Err(ProxyError::SinkWrite(_))));
        assert_eq!(sink.data, b"a");
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn test_end_on_failure_disabled() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"a")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut source = StreamSource::new(stream::iter(chunks));
        let mut sink = RecordingSink::default();
        let result = RelayPipe::new()
            .end_on_failure(false)
            .copy(&mut source, &mut sink)
            .await;
        assert!(matches!(result, Err(ProxyError::Io(_))));
        assert!(!sink.finished);
    }

    #[tokio::test]
    async fn test_meter_counts_prefix_and_body() {
        let meter = Arc::new(StreamMeter::default());
        let mut source = source_of(&["12345"]);
        let mut sink = RecordingSink::default();
        let copied = RelayPipe::new()
            .metered(meter.clone())
            .copy_with_prefix(Bytes::from_static(b"abc"), &mut source, false, &mut sink)
            .await
            .unwrap();
        assert_eq!(copied, 8);
        assert_eq!(sink.data, b"abc12345");
        assert_eq!(meter.pipes(), 1);
        assert_eq!(meter.bytes(), 8);
    }

    #[tokio::test]
    async fn test_ended_source_is_not_polled() {
        let chunks: Vec<io::Result<Bytes>> =
            vec![Err(io::Error::new(io::ErrorKind::Other, "must not be read"))];
        let mut source = StreamSource::new(stream::iter(chunks));
        let mut sink = RecordingSink::default();
        let copied = RelayPipe::new()
            .copy_with_prefix(Bytes::from_static(b"tail"), &mut source, true, &mut sink)
            .await
            .unwrap();
        assert_eq!(copied, 4);
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn test_into_body_streams_prefix_then_source() {
        let meter = Arc::new(StreamMeter::default());
        let body = RelayPipe::new()
            .metered(meter.clone())
            .into_body(Bytes::from_static(b"frame:"), source_of(&["to", "ken"]));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"frame:token");
        assert_eq!(meter.bytes(), 11);
    }

    #[tokio::test]
    async fn test_into_body_aborts_on_source_error() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let body = RelayPipe::new().into_body(Bytes::new(), StreamSource::new(stream::iter(chunks)));
        assert!(body.collect().await.is_err());
    }

    #[tokio::test]
    async fn test_backpressure_conserves_ten_mebibytes() {
        const TOTAL: usize = 10 * 1024 * 1024;
        let mut rng = StdRng::seed_from_u64(0xDEAD_BEEF);
        let mut data = vec![0u8; TOTAL];
        rng.fill_bytes(&mut data);

        let mut chunks: Vec<io::Result<Bytes>> = Vec::new();
        let mut offset = 0;
        while offset < TOTAL {
            let len = rng.gen_range(1..=65_536).min(TOTAL - offset);
            chunks.push(Ok(Bytes::copy_from_slice(&data[offset..offset + len])));
            offset += len;
        }
        let mut source = StreamSource::new(stream::iter(chunks));

        // Tiny pipe buffer and a reader that stalls now and then.
        let (mut writer, reader) = tokio::io::duplex(4096);
        let drain = tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = [0u8; 1024];
            let mut received = Vec::with_capacity(TOTAL);
            let mut reads = 0usize;
            loop {
                let n = reader.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                reads += 1;
                if reads % 512 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            received
        });

        let copied = RelayPipe::new().copy(&mut source, &mut writer).await.unwrap();
        drop(writer);
        let received = drain.await.unwrap();

        assert_eq!(copied, TOTAL as u64);
        assert_eq!(received.len(), TOTAL);
        assert!(received == data);
    }
}
