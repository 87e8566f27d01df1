//! Error replies and body length rules
//!
//! Every relayed request or tunnel gets at most one error reply. On the HTTP
//! legs the handler returns a single response; on the CONNECT leg the reply is
//! a `ConnectResult` frame guarded by a [`ConnectReplier`].

use crate::error::ProxyError;
use crate::gate::OnceGate;
use crate::protocol::frame;
use crate::protocol::ConnectResult;
use crate::stream::{empty_body, full_body, ProxyBody};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Plain-text response with the given status.
pub fn status_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let message = message.into();
    let mut response = if message.is_empty() {
        Response::new(empty_body())
    } else {
        let mut response = Response::new(full_body(message));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    };
    *response.status_mut() = status;
    response
}

/// Downstream reply for a failed relay.
pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    debug!("Replying {} for: {}", err.status(), err);
    status_response(err.status(), err.detail())
}

/// Length of an inbound HTTP/1 request body as announced by its headers.
///
/// `None` means the length is unknown and the body has to be streamed.
pub fn request_body_len(headers: &HeaderMap) -> Option<u64> {
    if headers.contains_key(TRANSFER_ENCODING) {
        return None;
    }
    match headers.get(CONTENT_LENGTH) {
        Some(value) => value.to_str().ok()?.trim().parse().ok(),
        None => Some(0),
    }
}

/// Responses that never carry a body, whatever their headers say.
pub fn is_bodyless(method: &Method, status: StatusCode) -> bool {
    method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Sends the single `ConnectResult` of a tunnel connection.
#[derive(Debug, Default)]
pub struct ConnectReplier {
    gate: OnceGate,
}

impl ConnectReplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_replied(&self) -> bool {
        self.gate.is_fired()
    }

    /// Write `result` as a frame. Returns `false` if a reply was already sent.
    pub async fn reply<W>(&self, stream: &mut W, result: &ConnectResult) -> io::Result<bool>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if !self.gate.try_fire() {
            return Ok(false);
        }
        stream.write_all(&frame::encode_envelope(result)).await?;
        stream.flush().await?;
        Ok(true)
    }

    /// Reply with the error's status code and message, then close the stream.
    pub async fn reject<W>(&self, stream: &mut W, code: u16, msg: impl Into<String>) -> io::Result<bool>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let sent = self
            .reply(stream, &ConnectResult::failed(code, msg))
            .await?;
        stream.shutdown().await?;
        Ok(sent)
    }

    pub async fn reject_error<W>(&self, stream: &mut W, err: &ProxyError) -> io::Result<bool>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.reject(stream, err.status().as_u16(), err.detail()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use crate::stream::scan;
    use crate::stream::ReadSource;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_error_response_carries_status_and_detail() {
        let err = ProxyError::UpstreamProtocol("remote agent replied 503".into());
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("503"));
    }

    #[tokio::test]
    async fn test_empty_status_response_has_no_body() {
        let response = status_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, "");
        assert!(response.headers().get(CONTENT_TYPE).is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[test]
    fn test_request_body_len_rules() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_body_len(&headers), Some(0));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(request_body_len(&headers), Some(42));

        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert_eq!(request_body_len(&headers), None);

        let mut bad = HeaderMap::new();
        bad.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert_eq!(request_body_len(&bad), None);
    }

    #[test]
    fn test_bodyless_responses() {
        assert!(is_bodyless(&Method::HEAD, StatusCode::OK));
        assert!(is_bodyless(&Method::GET, StatusCode::NO_CONTENT));
        assert!(is_bodyless(&Method::GET, StatusCode::NOT_MODIFIED));
        assert!(is_bodyless(&Method::GET, StatusCode::CONTINUE));
        assert!(!is_bodyless(&Method::GET, StatusCode::OK));
    }

    #[tokio::test]
    async fn test_connect_replier_replies_once() {
        let replier = ConnectReplier::new();
        let (mut near, far) = tokio::io::duplex(1024);

        assert!(replier
            .reject(&mut near, 407, crate::constants::NO_AUTH_MSG)
            .await
            .unwrap());
        assert!(!replier.reply(&mut near, &ConnectResult::ok()).await.unwrap());
        assert!(replier.has_replied());
        drop(near);

        let (body, continuation) = scan(ReadSource::new(far)).await.unwrap();
        let result = ConnectResult::from_bytes(&body).unwrap();
        assert_eq!(result, ConnectResult::failed(407, "No Auth"));
        let remainder = continuation.take_remainder().unwrap();
        assert!(remainder.remaining.is_empty());
    }
}
