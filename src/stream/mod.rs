//! Flow-controlled byte sources and sinks
//!
//! A [`ChunkSource`] hands out chunks only when polled, and the caller says
//! how many bytes it is willing to take (`limit`). Not polling is how a source
//! gets paused. A [`ChunkSink`] completes a write once the chunk was accepted,
//! which is the drain signal a relay waits on before pulling more.

pub mod bridge;
pub mod continuation;
pub mod pipe;
pub mod scanner;

pub use bridge::TunnelBridge;
pub use continuation::{Continuation, Remainder};
pub use pipe::RelayPipe;
pub use scanner::scan;

use crate::constants::DEFAULT_BUFFER_SIZE;
use bytes::Bytes;
use futures_util::Stream;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame};
use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;

/// A pull-based byte source.
pub trait ChunkSource: Send {
    /// Poll for the next chunk of at most `limit` bytes.
    ///
    /// `Ready(None)` is a clean end of stream. Sources with natural framing
    /// (HTTP bodies) may return larger chunks; callers must cope with that.
    fn poll_chunk(
        &mut self,
        cx: &mut Context<'_>,
        limit: usize,
    ) -> Poll<Option<io::Result<Bytes>>>;

    /// Whether the source is known to have nothing more to give.
    fn is_exhausted(&self) -> bool {
        false
    }
}

impl<S: ChunkSource + ?Sized> ChunkSource for &mut S {
    fn poll_chunk(
        &mut self,
        cx: &mut Context<'_>,
        limit: usize,
    ) -> Poll<Option<io::Result<Bytes>>> {
        (**self).poll_chunk(cx, limit)
    }

    fn is_exhausted(&self) -> bool {
        (**self).is_exhausted()
    }
}

/// Await the next chunk of at most `limit` bytes.
pub async fn next_chunk<S: ChunkSource + ?Sized>(
    source: &mut S,
    limit: usize,
) -> Option<io::Result<Bytes>> {
    poll_fn(|cx| source.poll_chunk(cx, limit)).await
}

/// A push-based byte sink with write-completion flow control.
pub trait ChunkSink: Send {
    /// Resolves once the sink has room for more.
    fn write_chunk(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Signal end of data to the other side.
    fn finish(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

impl<W: AsyncWrite + Unpin + Send> ChunkSink for W {
    fn write_chunk(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send {
        async move { self.write_all(&chunk).await }
    }

    fn finish(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        async move { self.shutdown().await }
    }
}

/// Socket or any other `AsyncRead` as a chunk source
#[derive(Debug)]
pub struct ReadSource<R> {
    inner: R,
    scratch: Box<[u8]>,
}

impl<R> ReadSource<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            scratch: vec![0u8; capacity.max(1)].into_boxed_slice(),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin + Send> ChunkSource for ReadSource<R> {
    fn poll_chunk(
        &mut self,
        cx: &mut Context<'_>,
        limit: usize,
    ) -> Poll<Option<io::Result<Bytes>>> {
        let want = limit.clamp(1, self.scratch.len());
        let mut buf = ReadBuf::new(&mut self.scratch[..want]);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
        let filled = buf.filled();
        if filled.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Ready(Some(Ok(Bytes::copy_from_slice(filled))))
        }
    }
}

/// HTTP body as a chunk source; trailers are skipped
#[derive(Debug)]
pub struct BodySource<B> {
    body: B,
}

impl<B> BodySource<B> {
    pub fn new(body: B) -> Self {
        Self { body }
    }
}

impl<B> ChunkSource for BodySource<B>
where
    B: Body<Data = Bytes> + Unpin + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_chunk(
        &mut self,
        cx: &mut Context<'_>,
        _limit: usize,
    ) -> Poll<Option<io::Result<Bytes>>> {
        loop {
            match ready!(Pin::new(&mut self.body).poll_frame(cx)) {
                None => return Poll::Ready(None),
                Some(Err(e)) => return Poll::Ready(Some(Err(io::Error::other(e)))),
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        return Poll::Ready(Some(Ok(data)));
                    }
                }
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.body.is_end_stream()
    }
}

/// Any `Stream` of byte chunks as a chunk source
#[derive(Debug)]
pub struct StreamSource<S> {
    stream: S,
    ended: bool,
}

impl<S> StreamSource<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            ended: false,
        }
    }
}

impl<S> ChunkSource for StreamSource<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
{
    fn poll_chunk(
        &mut self,
        cx: &mut Context<'_>,
        _limit: usize,
    ) -> Poll<Option<io::Result<Bytes>>> {
        if self.ended {
            return Poll::Ready(None);
        }
        let next = ready!(Pin::new(&mut self.stream).poll_next(cx));
        if next.is_none() {
            self.ended = true;
        }
        Poll::Ready(next)
    }

    fn is_exhausted(&self) -> bool {
        self.ended
    }
}

/// Body type used for every response and outbound request
pub type ProxyBody = BoxBody<Bytes, io::Error>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Streaming body fed by a [`BodySink`]
#[derive(Debug)]
pub struct ChannelBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|item| item.map(|chunk| chunk.map(Frame::data)))
    }
}

/// Writer half of a streaming HTTP body
///
/// The channel is bounded, so `write_chunk` waits while the HTTP connection
/// is not consuming.
#[derive(Debug)]
pub struct BodySink {
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
}

/// Create a streaming body and the sink that feeds it.
pub fn body_channel(capacity: usize) -> (BodySink, ProxyBody) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BodySink { tx: Some(tx) }, ChannelBody { rx }.boxed())
}

impl BodySink {
    /// Abort the body so the HTTP connection reports an error to its peer.
    pub async fn abort(&mut self, error: io::Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error)).await;
        }
    }
}

impl ChunkSink for BodySink {
    fn write_chunk(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            match &self.tx {
                Some(tx) => tx.send(Ok(chunk)).await.map_err(|_| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "Body receiver dropped")
                }),
                None => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "Body already finished",
                )),
            }
        }
    }

    fn finish(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        self.tx = None;
        std::future::ready(Ok(()))
    }
}
