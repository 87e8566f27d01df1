//! Local agent
//!
//! Browser-facing HTTP proxy. Plain requests are wrapped in a `Request` frame
//! and posted to the remote agent over h2c; CONNECT requests open a framed
//! tunnel to the remote agent's CONNECT listener and are spliced onto it once
//! the remote accepted.

use crate::auth::AuthGenerator;
use crate::config::ClientConfig;
use crate::constants::{AUTH_HEADER, DEFAULT_HTTPS_PORT};
use crate::error::ProxyError;
use crate::metrics::{spawn_reporter, StreamKind, TrafficMetrics};
use crate::protocol::{frame, ConnectRequest, ConnectResult, Envelope, Headers};
use crate::protocol::{Request as RequestEnvelope, Response as ResponseEnvelope};
use crate::responder::{error_response, request_body_len, status_response};
use crate::route::HostPort;
use crate::stream::{
    empty_body, full_body, scan, BodySource, ProxyBody, ReadSource, RelayPipe, Remainder,
    TunnelBridge,
};
use crate::tls::{self, BoxedStream};
use anyhow::Context;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, EXPECT, HOST};
use http::{Method, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

type RemoteClient = Client<HttpConnector, ProxyBody>;

/// The local agent
pub struct LocalAgent {
    ctx: Arc<LocalContext>,
}

struct LocalContext {
    config: ClientConfig,
    auth: AuthGenerator,
    remote: RemoteClient,
    remote_http_uri: Uri,
    remote_connect: HostPort,
    connector: Option<TlsConnector>,
    metrics: Option<Arc<TrafficMetrics>>,
}

impl LocalAgent {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let auth = config.auth_generator()?;
        let connector = tls::connector(&config.tls)?;

        let remote_http = HostPort::new(config.remote_host.clone(), config.http_port);
        let remote_http_uri: Uri = format!("http://{}/", remote_http)
            .parse()
            .with_context(|| format!("Invalid remote host: {}", config.remote_host))?;
        let remote_connect = HostPort::new(config.remote_host.clone(), config.https_port);

        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_connect_timeout(Some(config.timeouts.connect()));
        let remote = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .build(http);

        let metrics = config
            .metrics
            .enabled
            .then(|| Arc::new(TrafficMetrics::new()));

        Ok(Self {
            ctx: Arc::new(LocalContext {
                config,
                auth,
                remote,
                remote_http_uri,
                remote_connect,
                connector,
                metrics,
            }),
        })
    }

    pub fn metrics(&self) -> Option<Arc<TrafficMetrics>> {
        self.ctx.metrics.clone()
    }

    /// Bind the proxy port and serve until ctrl-c.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = format!(
            "{}:{}",
            self.ctx.config.bind_address, self.ctx.config.local_port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {}", addr))?;
        info!(
            "Local agent listening on {}, remote agent {}",
            addr, self.ctx.config.remote_host
        );

        self.serve(listener, async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Signal handler error: {}", e);
            }
        })
        .await
    }

    /// Accept proxy connections until `shutdown` completes.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
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
                result = listener.accept() => {
                    let (socket, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let ctx = self.ctx.clone();
                    let span = info_span!("conn", id = %Uuid::new_v4(), peer = %peer_addr);
                    tokio::spawn(
                        async move {
                            if let Err(e) = ctx.serve_connection(socket).await {
                                debug!("Connection ended with error: {}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping local agent");
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

/// Absolute URI of a proxied request: the request target when it is in
/// absolute form, otherwise rebuilt from the Host header.
fn absolute_uri<B>(req: &Request<B>) -> Option<String> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Some(uri.to_string());
    }
    let host = req.headers().get(HOST)?.to_str().ok()?.trim();
    if host.is_empty() {
        return None;
    }
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    Some(format!("http://{}{}", host, path))
}

/// CONNECT target from the request authority, or the Host header.
fn connect_target<B>(req: &Request<B>) -> Option<HostPort> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.as_str().to_string(),
        None => req.headers().get(HOST)?.to_str().ok()?.to_string(),
    };
    HostPort::parse(&authority, DEFAULT_HTTPS_PORT).ok()
}

impl LocalContext {
    fn pipe(&self, kind: StreamKind) -> RelayPipe {
        match &self.metrics {
            Some(metrics) => RelayPipe::new().metered(metrics.meter(kind)),
            None => RelayPipe::new(),
        }
    }

    async fn serve_connection(self: Arc<Self>, socket: TcpStream) -> Result<(), hyper::Error> {
        let _ = socket.set_nodelay(true);
        let service = service_fn(move |req| {
            let ctx = self.clone();
            async move { Ok::<_, Infallible>(ctx.handle(req).await) }
        });
        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(socket), service)
            .with_upgrades()
            .await
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let result = if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_http(req).await
        };
        result.unwrap_or_else(|e| {
            warn!("Relay failed: {}", e);
            error_response(&e)
        })
    }

    async fn handle_http(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        if let Some(expect) = req.headers().get(EXPECT) {
            if !expect.as_bytes().eq_ignore_ascii_case(b"100-continue") {
                return Ok(status_response(StatusCode::EXPECTATION_FAILED, ""));
            }
        }
        let Some(absolute_uri) = absolute_uri(&req) else {
            return Ok(status_response(StatusCode::BAD_REQUEST, "Missing Host header"));
        };
        let body_len = request_body_len(req.headers());

        let (mut parts, body) = req.into_parts();
        // Answered here; the remote must not wait for a 100 again.
        parts.headers.remove(EXPECT);
        let mut headers = Headers::from_header_map(&parts.headers);
        headers.remove_hop_by_hop();
        debug!("[-->] {} {}", parts.method, absolute_uri);

        let prefix = frame::encode_envelope(&RequestEnvelope {
            method: parts.method,
            absolute_uri,
            scheme: "http".to_string(),
            version: parts.version.into(),
            headers,
        });
        let outer_len = body_len.map(|len| prefix.len() as u64 + len);
        let outbound_body = match body_len {
            Some(0) => full_body(prefix),
            _ => self
                .pipe(StreamKind::HttpUp)
                .into_body(prefix, BodySource::new(body)),
        };

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.remote_http_uri.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(AUTH_HEADER, self.auth.header_value()?);
        if let Some(len) = outer_len {
            builder = builder.header(CONTENT_LENGTH, len);
        }
        let outbound = builder
            .body(outbound_body)
            .map_err(|e| ProxyError::UpstreamProtocol(e.to_string()))?;

        let outcome = timeout(self.config.timeouts.request(), self.remote.request(outbound)).await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(ProxyError::from_client_error(
                    format!("remote agent {}", self.remote_http_uri),
                    &e,
                ))
            }
            Err(_) => {
                return Err(ProxyError::UpstreamTimeout(format!(
                    "remote agent {}",
                    self.remote_http_uri
                )))
            }
        };
        if response.status() != StatusCode::OK {
            return Err(ProxyError::UpstreamProtocol(format!(
                "Remote agent replied {}",
                response.status()
            )));
        }

        let (response_bytes, continuation) = scan(BodySource::new(response.into_body())).await?;
        let envelope = ResponseEnvelope::from_bytes(&response_bytes)?;
        let status = StatusCode::from_u16(envelope.status_code).map_err(|_| {
            ProxyError::Decode(format!("Invalid status code {}", envelope.status_code))
        })?;
        let mut headers = envelope.headers;
        headers.remove_hop_by_hop();
        debug!("[<--] {}", status);

        let mut downstream = Response::new(continuation.into_body(self.pipe(StreamKind::HttpDown))?);
        *downstream.status_mut() = status;
        *downstream.headers_mut() = headers.to_header_map();
        if let Some(reason) = envelope
            .status_message
            .and_then(|msg| ReasonPhrase::try_from(msg).ok())
        {
            downstream.extensions_mut().insert(reason);
        }
        Ok(downstream)
    }

    async fn handle_connect(
        &self,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let Some(target) = connect_target(&req) else {
            return Ok(status_response(StatusCode::BAD_REQUEST, "Missing CONNECT target"));
        };
        let mut headers = Headers::from_header_map(req.headers());
        headers.remove_hop_by_hop();
        let request = ConnectRequest {
            host: target.host.clone(),
            port: target.port,
            headers,
            auth: Some(self.auth.generate()?),
        };

        let mut remote = self.dial_remote().await?;
        remote.write_all(&frame::encode_envelope(&request)).await?;
        remote.flush().await?;
        debug!("[-->] CONNECT {}", target);

        let (result, remaining, remote) =
            timeout(self.config.timeouts.request(), read_connect_result(remote))
                .await
                .map_err(|_| {
                    ProxyError::UpstreamTimeout(format!("tunnel reply from {}", self.remote_connect))
                })??;
        if !result.is_ok() {
            let status = StatusCode::from_u16(result.code).unwrap_or(StatusCode::BAD_GATEWAY);
            let msg = result.msg.unwrap_or_default();
            warn!("Remote agent refused tunnel to {}: {} {}", target, result.code, msg);
            return Ok(status_response(status, msg));
        }

        let on_upgrade = hyper::upgrade::on(&mut req);
        let bridge = TunnelBridge::new(
            self.pipe(StreamKind::HttpsDown),
            self.pipe(StreamKind::HttpsUp),
        );
        tokio::spawn(
            async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        match bridge.run(remote, TokioIo::new(upgraded), remaining).await {
                            Ok(end) => debug!("[<--] Tunnel to {} closed ({:?})", target, end),
                            Err(e) => debug!("Tunnel to {} failed: {}", target, e),
                        }
                    }
                    Err(e) => warn!("Upgrade of CONNECT to {} failed: {}", target, e),
                }
            }
            .in_current_span(),
        );

        Ok(Response::new(empty_body()))
    }

    async fn dial_remote(&self) -> Result<BoxedStream, ProxyError> {
        let addr = self.remote_connect.to_connect_addr();
        let connect = async {
            let tcp = TcpStream::connect(&addr).await?;
            tcp.set_nodelay(true)?;
            let stream: BoxedStream = match &self.connector {
                Some(connector) => {
                    let name = tls::server_name(&self.remote_connect.host)?;
                    Box::new(connector.connect(name, tcp).await?)
                }
                None => Box::new(tcp),
            };
            Ok::<_, io::Error>(stream)
        };

        let outcome = timeout(self.config.timeouts.connect(), connect).await;
        match outcome {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProxyError::UpstreamConnect { addr, source }),
            Err(_) => Err(ProxyError::UpstreamTimeout(addr)),
        }
    }
}

async fn read_connect_result(
    remote: BoxedStream,
) -> Result<(ConnectResult, Bytes, BoxedStream), ProxyError> {
    let (body, continuation) = scan(ReadSource::new(remote)).await?;
    let result = ConnectResult::from_bytes(&body)?;
    let Remainder {
        remaining, source, ..
    } = continuation.take_remainder()?;
    Ok((result, remaining, source.into_inner()))
}
