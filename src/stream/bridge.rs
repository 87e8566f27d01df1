//! Tunnel bridge
//!
//! Splices two established connections into a full-duplex tunnel. Each
//! direction is its own [`RelayPipe`]; when either direction stops, or
//! [`TunnelBridge::close`] is called, both connections are shut down, once.

use crate::error::ProxyError;
use crate::gate::OnceGate;
use crate::stream::{ReadSource, RelayPipe};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Why a bridge stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    /// Side A stopped sending (or failed)
    SideA,
    /// Side B stopped sending (or failed)
    SideB,
    /// [`TunnelBridge::close`] was called
    Closed,
}

#[derive(Debug)]
pub struct TunnelBridge {
    a_to_b: RelayPipe,
    b_to_a: RelayPipe,
    teardown: OnceGate,
    close_requested: Notify,
}

impl Default for TunnelBridge {
    fn default() -> Self {
        Self::new(RelayPipe::new(), RelayPipe::new())
    }
}

impl TunnelBridge {
    /// Build a bridge; the pipes' end flags are ignored, teardown is shared.
    pub fn new(a_to_b: RelayPipe, b_to_a: RelayPipe) -> Self {
        Self {
            a_to_b: a_to_b.end_on_complete(false),
            b_to_a: b_to_a.end_on_complete(false),
            teardown: OnceGate::new(),
            close_requested: Notify::new(),
        }
    }

    /// Ask a running (or future) `run` to tear the tunnel down.
    pub fn close(&self) {
        self.close_requested.notify_one();
    }

    /// Both connections have been shut down.
    pub fn is_closed(&self) -> bool {
        self.teardown.is_fired()
    }

    /// Relay `a ⇄ b` until one side stops, then close both.
    ///
    /// `a_prefix` is written to `b` before anything read from `a`, for bytes
    /// that were buffered while the tunnel was being negotiated.
    pub async fn run<A, B>(&self, a: A, b: B, a_prefix: Bytes) -> Result<BridgeEnd, ProxyError>
    where
        A: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (a_read, mut a_write) = tokio::io::split(a);
        let (b_read, mut b_write) = tokio::io::split(b);
        let mut a_source = ReadSource::new(a_read);
        let mut b_source = ReadSource::new(b_read);

        let outcome = {
            let upstream =
                self.a_to_b
                    .copy_with_prefix(a_prefix, &mut a_source, false, &mut b_write);
            let downstream = self.b_to_a.copy(&mut b_source, &mut a_write);
            tokio::pin!(upstream, downstream);

            tokio::select! {
                result = &mut upstream => {
                    debug!("[-->] side A finished: {:?}", result);
                    result.map(|_| BridgeEnd::SideA)
                }
                result = &mut downstream => {
                    debug!("[<--] side B finished: {:?}", result);
                    result.map(|_| BridgeEnd::SideB)
                }
                _ = self.close_requested.notified() => Ok(BridgeEnd::Closed),
            }
        };

        if self.teardown.try_fire() {
            if let Err(e) = a_write.shutdown().await {
                debug!("Shutdown of side A failed: {}", e);
            }
            if let Err(e) = b_write.shutdown().await {
                debug!("Shutdown of side B failed: {}", e);
            }
        }

        if let Err(e) = &outcome {
            warn!("Tunnel torn down after error: {}", e);
        }
        outcome
    }
}
