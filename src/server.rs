//! Remote agent
//!
//! Egress side of the proxy. The HTTP listener accepts framed requests posted
//! by local agents and performs them against the origin; the CONNECT listener
//! accepts a `ConnectRequest` frame and then splices the connection onto a TCP
//! connection to the requested target.

use crate::auth::SecretTable;
use crate::config::ServerConfig;
use crate::constants::{AUTH_HEADER, NO_AUTH_MSG};
use crate::error::ProxyError;
use crate::metrics::{spawn_reporter, StreamKind, TrafficMetrics};
use crate::protocol::{frame, ConnectRequest, ConnectResult, Envelope, Headers};
use crate::protocol::{Request as RequestEnvelope, Response as ResponseEnvelope};
use crate::responder::{error_response, is_bodyless, status_response, ConnectReplier};
use crate::route::HostPort;
use crate::stream::{full_body, scan, BodySource, ProxyBody, ReadSource, RelayPipe, TunnelBridge};
use crate::tls::{self, BoxedStream};
use anyhow::Context;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use hyper::body::{Body, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

type UpstreamClient = Client<HttpConnector, ProxyBody>;

/// The remote agent with both listeners
pub struct RemoteAgent {
    ctx: Arc<RemoteContext>,
}

struct RemoteContext {
    config: ServerConfig,
    secrets: SecretTable,
    upstream: UpstreamClient,
    acceptor: Option<TlsAcceptor>,
    metrics: Option<Arc<TrafficMetrics>>,
}

impl RemoteAgent {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let secrets = config.secret_table()?;
        let acceptor = tls::acceptor(&config.tls)?;

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(config.timeouts.connect()));
        let upstream = Client::builder(TokioExecutor::new()).build(connector);

        let metrics = config
            .metrics
            .enabled
            .then(|| Arc::new(TrafficMetrics::new()));

        Ok(Self {
            ctx: Arc::new(RemoteContext {
                config,
                secrets,
                upstream,
                acceptor,
                metrics,
            }),
        })
    }

    pub fn metrics(&self) -> Option<Arc<TrafficMetrics>> {
        self.ctx.metrics.clone()
    }

    /// Bind both listeners and serve until ctrl-c.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = &self.ctx.config;
        let http_addr = format!("{}:{}", config.bind_address, config.http_port);
        let connect_addr = format!("{}:{}", config.bind_address, config.https_port);

        let http_listener = TcpListener::bind(&http_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", http_addr))?;
        let connect_listener = TcpListener::bind(&connect_addr)
            .await
            .with_context(|| format!("Failed to bind CONNECT listener on {}", connect_addr))?;
        info!("Remote agent HTTP listener on {}", http_addr);
        info!(
            "Remote agent CONNECT listener on {} (tls: {})",
            connect_addr,
            self.ctx.acceptor.is_some()
        );

        self.serve(http_listener, connect_listener, async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Signal handler error: {}", e);
            }
        })
        .await
    }

    /// Accept on both listeners until `shutdown` completes.
    pub async fn serve<F>(
        self,
        http_listener: TcpListener,
        connect_listener: TcpListener,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let reporter = self
            .ctx
            .metrics
            .clone()
            .map(|metrics| spawn_reporter(metrics, self.ctx.config.metrics.interval()));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = http_listener.accept() => {
                    let (socket, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("HTTP accept failed: {}", e);
                            continue;
                        }
                    };
                    let ctx = self.ctx.clone();
                    let span = info_span!("http", id = %Uuid::new_v4(), peer = %peer_addr);
                    tokio::spawn(
                        async move {
                            if let Err(e) = ctx.serve_http(socket).await {
                                debug!("HTTP connection ended with error: {}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
                result = connect_listener.accept() => {
                    let (socket, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("CONNECT accept failed: {}", e);
                            continue;
                        }
                    };
                    let ctx = self.ctx.clone();
                    let span = info_span!("tunnel", id = %Uuid::new_v4(), peer = %peer_addr);
                    tokio::spawn(
                        async move {
                            if let Err(e) = ctx.handle_tunnel(socket).await {
                                warn!("Tunnel failed: {}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping remote agent");
                    break;
                }
            }
        }

        if let Some(reporter) = reporter {
            reporter.abort();
        }
        Ok(())
    }
}

impl RemoteContext {
    fn pipe(&self, kind: StreamKind) -> RelayPipe {
        match &self.metrics {
            Some(metrics) => RelayPipe::new().metered(metrics.meter(kind)),
            None => RelayPipe::new(),
        }
    }

    async fn serve_http(
        self: Arc<Self>,
        socket: TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _ = socket.set_nodelay(true);
        let service = service_fn(move |req| {
            let ctx = self.clone();
            async move { Ok::<_, Infallible>(ctx.handle_relay(req).await) }
        });
        auto::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(socket), service)
            .await
    }

    async fn handle_relay(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() != Method::POST {
            return status_response(StatusCode::METHOD_NOT_ALLOWED, "");
        }
        let auth = req
            .headers()
            .get(AUTH_HEADER)
            .and_then(|value| value.to_str().ok());
        if !self.secrets.verify_header(auth) {
            warn!("Rejected relay request without valid authentication");
            return status_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, "");
        }

        match self.relay(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Relay failed: {}", e);
                error_response(&e)
            }
        }
    }

    async fn relay(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let (request_bytes, continuation) = scan(BodySource::new(req.into_body())).await?;
        let RequestEnvelope {
            method,
            absolute_uri,
            headers,
            ..
        } = RequestEnvelope::from_bytes(&request_bytes)?;
        let uri: Uri = absolute_uri
            .parse()
            .map_err(|e| ProxyError::Decode(format!("Invalid URI {}: {}", absolute_uri, e)))?;
        let mut headers = headers;
        headers.remove_hop_by_hop();
        debug!("[-->] {} {}", method, uri);

        let mut upstream_request = Request::new(continuation.into_body(self.pipe(StreamKind::HttpUp))?);
        *upstream_request.method_mut() = method.clone();
        *upstream_request.uri_mut() = uri.clone();
        *upstream_request.headers_mut() = headers.to_header_map();

        let outcome = timeout(
            self.config.timeouts.request(),
            self.upstream.request(upstream_request),
        )
        .await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ProxyError::from_client_error(uri.to_string(), &e)),
            Err(_) => return Err(ProxyError::UpstreamTimeout(uri.to_string())),
        };

        let status = response.status();
        debug!("[<--] {} {}", status, uri);
        let (parts, body) = response.into_parts();
        let mut response_headers = Headers::from_header_map(&parts.headers);
        response_headers.remove_hop_by_hop();
        // hyper only keeps a reason phrase that differs from the canonical one.
        let status_message = parts
            .extensions
            .get::<ReasonPhrase>()
            .and_then(|reason| std::str::from_utf8(reason.as_bytes()).ok())
            .or(status.canonical_reason())
            .map(str::to_string);
        let prefix = frame::encode_envelope(&ResponseEnvelope {
            status_code: status.as_u16(),
            status_message,
            headers: response_headers,
        });

        let upstream_len = if is_bodyless(&method, status) {
            Some(0)
        } else {
            body.size_hint().exact()
        };
        let reply_len = upstream_len.map(|len| prefix.len() as u64 + len);
        let reply_body = match upstream_len {
            Some(0) => full_body(prefix),
            _ => self
                .pipe(StreamKind::HttpDown)
                .into_body(prefix, BodySource::new(body)),
        };

        let mut reply = Response::new(reply_body);
        reply.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        if let Some(len) = reply_len {
            reply.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        Ok(reply)
    }

    async fn handle_tunnel(self: Arc<Self>, socket: TcpStream) -> Result<(), ProxyError> {
        let _ = socket.set_nodelay(true);
        // TLS handshake and tunnel request share one deadline.
        let deadline = Instant::now() + self.config.timeouts.request();
        let stream: BoxedStream = match &self.acceptor {
            Some(acceptor) => match timeout_at(deadline, acceptor.accept(socket)).await {
                Ok(accepted) => Box::new(accepted?),
                Err(_) => {
                    warn!("TLS handshake timed out");
                    return Ok(());
                }
            },
            None => Box::new(socket),
        };

        let replier = ConnectReplier::new();
        let mut source = ReadSource::new(stream);
        let scanned = match timeout_at(deadline, scan(&mut source)).await {
            Ok(Ok((request_bytes, continuation))) => continuation
                .take_remainder()
                .map(|remainder| (request_bytes, remainder.remaining)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProxyError::Frame(
                "Timed out waiting for the tunnel request".into(),
            )),
        };
        let mut stream = source.into_inner();

        let (request, remaining) = match scanned
            .and_then(|(bytes, remaining)| Ok((ConnectRequest::from_bytes(&bytes)?, remaining)))
        {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Bad tunnel request: {}", e);
                replier.reject_error(&mut stream, &e).await?;
                return Ok(());
            }
        };

        let authorized = request
            .auth
            .as_ref()
            .is_some_and(|auth| self.secrets.verify(auth));
        if !authorized {
            warn!(
                "Rejected tunnel to {}:{} without valid authentication",
                request.host, request.port
            );
            replier.reject(&mut stream, 407, NO_AUTH_MSG).await?;
            return Ok(());
        }

        let target = HostPort::new(request.host, request.port);
        let addr = target.to_connect_addr();
        let outcome = timeout(self.config.timeouts.connect(), TcpStream::connect(&addr)).await;
        let upstream = match outcome {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(source)) => {
                let e = ProxyError::UpstreamConnect { addr, source };
                warn!("{}", e);
                replier.reject_error(&mut stream, &e).await?;
                return Ok(());
            }
            Err(_) => {
                let e = ProxyError::UpstreamTimeout(addr);
                warn!("{}", e);
                replier.reject_error(&mut stream, &e).await?;
                return Ok(());
            }
        };
        let _ = upstream.set_nodelay(true);

        replier.reply(&mut stream, &ConnectResult::ok()).await?;
        info!("[-->] Tunnel open to {}", target);

        let bridge = TunnelBridge::new(
            self.pipe(StreamKind::HttpsUp),
            self.pipe(StreamKind::HttpsDown),
        );
        let end = bridge.run(stream, upstream, remaining).await?;
        debug!("[<--] Tunnel to {} closed ({:?})", target, end);
        Ok(())
    }
}
