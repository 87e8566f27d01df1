//! Error taxonomy for the proxy core
//!
//! Every failure on a relayed request ends up as one of these variants and is
//! reported to the downstream caller exactly once, either as an HTTP status or
//! inside a `ConnectResult` frame.

use http::StatusCode;
use hyper_util::client::legacy::Error as ClientError;
use std::error::Error as StdError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Bad magic or illegal body length in a frame header.
    #[error("Frame error: {0}")]
    Frame(String),
    /// The source ended before the frame was complete.
    #[error("Stream ended after {received} of {expected} frame bytes")]
    PrematureEnd { received: usize, expected: usize },
    /// Missing, malformed, expired or non-matching proxy authentication.
    #[error("Proxy authentication failed: {0}")]
    Auth(String),
    #[error("Failed to connect to upstream {addr}: {source}")]
    UpstreamConnect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Upstream {0} timed out")]
    UpstreamTimeout(String),
    /// Non-success outer status on the HTTP leg, or a failed upstream exchange.
    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),
    /// The destination rejected a write.
    #[error("Sink write failed: {0}")]
    SinkWrite(#[source] io::Error),
    /// The frame body is not a valid envelope.
    #[error("Envelope decode error: {0}")]
    Decode(String),
    #[error("Continuation already consumed")]
    ContinuationReused,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Status reported to the downstream caller.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Auth(_) => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Plain-text detail for error bodies, including the source chain.
    pub fn detail(&self) -> String {
        render_chain(self)
    }

    /// Classify a failed exchange with the next hop at `target`.
    ///
    /// Connect failures are `UpstreamConnect`, or `UpstreamTimeout` when the
    /// connector gave up waiting. Everything else is a protocol failure.
    pub fn from_client_error(target: impl Into<String>, err: &ClientError) -> Self {
        let target = target.into();
        if !err.is_connect() {
            return ProxyError::UpstreamProtocol(format!("{}: {}", target, render_chain(err)));
        }

        let mut kind = io::ErrorKind::Other;
        let mut source = err.source();
        while let Some(cause) = source {
            if cause.is::<tokio::time::error::Elapsed>() {
                return ProxyError::UpstreamTimeout(target);
            }
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                if io_err.kind() == io::ErrorKind::TimedOut {
                    return ProxyError::UpstreamTimeout(target);
                }
                kind = io_err.kind();
            }
            source = cause.source();
        }
        ProxyError::UpstreamConnect {
            addr: target,
            source: io::Error::new(kind, render_chain(err)),
        }
    }
}

/// An error and its sources on one line, skipping text a parent already shows.
pub fn render_chain(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}
