//! Traffic metrics
//!
//! One meter per relay direction, counting pipes opened and bytes read. Meters
//! are shared across connections, so everything is atomic.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

/// Relay direction a meter is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    HttpUp,
    HttpDown,
    HttpsUp,
    HttpsDown,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::HttpUp,
        StreamKind::HttpDown,
        StreamKind::HttpsUp,
        StreamKind::HttpsDown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::HttpUp => "http_up",
            StreamKind::HttpDown => "http_down",
            StreamKind::HttpsUp => "https_up",
            StreamKind::HttpsDown => "https_down",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct StreamMeter {
    pipes: AtomicU64,
    bytes: AtomicU64,
}

impl StreamMeter {
    pub fn pipe_opened(&self) {
        self.pipes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn pipes(&self) -> u64 {
        self.pipes.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Meters for every [`StreamKind`]
#[derive(Debug, Default)]
pub struct TrafficMetrics {
    http_up: Arc<StreamMeter>,
    http_down: Arc<StreamMeter>,
    https_up: Arc<StreamMeter>,
    https_down: Arc<StreamMeter>,
}

impl TrafficMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meter(&self, kind: StreamKind) -> Arc<StreamMeter> {
        match kind {
            StreamKind::HttpUp => self.http_up.clone(),
            StreamKind::HttpDown => self.http_down.clone(),
            StreamKind::HttpsUp => self.https_up.clone(),
            StreamKind::HttpsDown => self.https_down.clone(),
        }
    }

    /// One line per stream kind: `http_up pipes=3 bytes=1024`.
    pub fn summary(&self) -> Vec<String> {
        StreamKind::ALL
            .iter()
            .map(|kind| {
                let meter = self.meter(*kind);
                format!("{} pipes={} bytes={}", kind, meter.pipes(), meter.bytes())
            })
            .collect()
    }
}

/// Log a metrics snapshot every `interval` until the task is aborted.
pub fn spawn_reporter(metrics: Arc<TrafficMetrics>, interval: Duration) -> JoinHandle<()> {
    let start_time = Instant::now();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(
                "Traffic after {}s: {}",
                start_time.elapsed().as_secs(),
                metrics.summary().join(", ")
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meters_are_shared_per_kind() {
        let metrics = TrafficMetrics::new();
        metrics.meter(StreamKind::HttpUp).pipe_opened();
        metrics.meter(StreamKind::HttpUp).record(100);
        metrics.meter(StreamKind::HttpUp).record(28);
        metrics.meter(StreamKind::HttpsDown).record(7);

        assert_eq!(metrics.meter(StreamKind::HttpUp).pipes(), 1);
        assert_eq!(metrics.meter(StreamKind::HttpUp).bytes(), 128);
        assert_eq!(metrics.meter(StreamKind::HttpDown).bytes(), 0);
        assert_eq!(metrics.meter(StreamKind::HttpsDown).bytes(), 7);
    }

    #[test]
    fn test_summary_lists_every_kind() {
        let metrics = TrafficMetrics::new();
        metrics.meter(StreamKind::HttpsUp).record(5);
        let summary = metrics.summary();
        assert_eq!(summary.len(), 4);
        assert!(summary.contains(&"https_up pipes=0 bytes=5".to_string()));
    }
}
