use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use http::header::HOST;
use http::uri::{Authority, Scheme};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use openssl::ssl::{Ssl, SslAcceptor};
use snare_net::{LeafIssuer, TlsConfig, build_acceptor};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UpstreamConfig;
use crate::encoding::{gunzip_response, restrict_accept_encoding, strip_hop_by_hop};
use crate::error::{ModifyError, ProxyError};
use crate::exchange::ExchangeContext;
use crate::modify::{
    BoxError, ForwardedRequest, ModifierPipeline, PipelineBuilder, ProxyRequest, ProxyResponse,
    RequestModifyMiddleware, ResponseModifyMiddleware, empty_body,
};
use crate::upstream::{HttpUpstream, Upstream, UpstreamError};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

pub struct Proxy {
    state: Arc<ProxyState>,
}

struct ProxyState {
    acceptor: SslAcceptor,
    pipeline: ModifierPipeline,
    upstream: Arc<dyn Upstream>,
    decode_gzip: bool,
}

pub struct ProxyBuilder {
    issuer: Arc<LeafIssuer>,
    tls: TlsConfig,
    upstream: Option<Arc<dyn Upstream>>,
    upstream_config: UpstreamConfig,
    decode_gzip: bool,
    pipeline: PipelineBuilder,
}

impl Proxy {
    pub fn builder(issuer: Arc<LeafIssuer>) -> ProxyBuilder {
        let upstream_config = UpstreamConfig::default();
        ProxyBuilder {
            issuer,
            tls: TlsConfig::default(),
            upstream: None,
            decode_gzip: upstream_config.decode_gzip,
            upstream_config,
            pipeline: PipelineBuilder::default(),
        }
    }

    /// Accepts client connections until `shutdown` fires. Open connections
    /// are asked to finish gracefully.
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ProxyError> {
        info!(addr = ?listener.local_addr().ok(), "proxy listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%peer, error = %err, "set_nodelay failed");
            }
            debug!(%peer, "client connected");
            tokio::spawn(serve_connection(
                Arc::clone(&self.state),
                stream,
                None,
                shutdown.clone(),
            ));
        }

        info!("proxy stopped");
        Ok(())
    }
}

impl ProxyBuilder {
    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Replaces the default HTTP transport.
    pub fn upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn upstream_config(mut self, config: UpstreamConfig) -> Self {
        self.decode_gzip = config.decode_gzip;
        self.upstream_config = config;
        self
    }

    pub fn decode_gzip(mut self, enabled: bool) -> Self {
        self.decode_gzip = enabled;
        self
    }

    pub fn request_modifier(mut self, stage: RequestModifyMiddleware) -> Self {
        self.pipeline = self.pipeline.request_modifier(stage);
        self
    }

    pub fn response_modifier(mut self, stage: ResponseModifyMiddleware) -> Self {
        self.pipeline = self.pipeline.response_modifier(stage);
        self
    }

    pub fn build(self) -> Result<Proxy, ProxyError> {
        let acceptor = build_acceptor(&self.tls, self.issuer)?;
        let upstream = match self.upstream {
            Some(upstream) => upstream,
            None => Arc::new(HttpUpstream::new(&self.upstream_config)?),
        };
        Ok(Proxy {
            state: Arc::new(ProxyState {
                acceptor,
                pipeline: self.pipeline.build(),
                upstream,
                decode_gzip: self.decode_gzip,
            }),
        })
    }
}

/// Serves HTTP/1.1 on one client connection. `tunnel` is the CONNECT target
/// when `io` is a decrypted tunnel; such connections re-enter here from
/// `handle_connect`.
fn serve_connection<IO>(
    state: Arc<ProxyState>,
    io: IO,
    tunnel: Option<Authority>,
    shutdown: CancellationToken,
) -> BoxFuture<'static, ()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async move {
        let connection = shutdown.child_token();
        let _connection_guard = connection.clone().drop_guard();

        let service = {
            let shutdown = shutdown.clone();
            service_fn(move |req: Request<Incoming>| {
                let state = Arc::clone(&state);
                let tunnel = tunnel.clone();
                let connection = connection.clone();
                let shutdown = shutdown.clone();
                async move {
                    Ok::<_, Infallible>(handle(state, req, tunnel, connection, shutdown).await)
                }
            })
        };

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(err) = result {
            debug!(error = %err, "client connection closed");
        }
    }
    .boxed()
}

async fn handle(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    tunnel: Option<Authority>,
    connection: CancellationToken,
    shutdown: CancellationToken,
) -> ProxyResponse {
    if req.method() == Method::CONNECT {
        return handle_connect(state, req, shutdown);
    }

    let ctx = ExchangeContext::new(connection.child_token());
    let req = req.map(|body| body.map_err(BoxError::from).boxed());
    forward(&state, ctx, req, tunnel.as_ref()).await
}

/// Acknowledges the tunnel, then terminates TLS on the upgraded connection
/// and serves it like any other client connection.
fn handle_connect(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    shutdown: CancellationToken,
) -> ProxyResponse {
    let Some(authority) = req.uri().authority().cloned() else {
        warn!(uri = %req.uri(), "CONNECT without authority");
        return error_response(StatusCode::BAD_REQUEST);
    };

    let upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                warn!(%authority, error = %err, "tunnel upgrade failed");
                return;
            }
        };
        let tls = match accept_tls(&state.acceptor, TokioIo::new(upgraded)).await {
            Ok(tls) => tls,
            Err(err) => {
                warn!(%authority, error = %err, "TLS handshake failed");
                return;
            }
        };
        debug!(%authority, "tunnel established");
        serve_connection(state, tls, Some(authority), shutdown).await;
    });

    Response::new(empty_body())
}

async fn accept_tls<IO>(acceptor: &SslAcceptor, io: IO) -> Result<SslStream<IO>, ProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let ssl = Ssl::new(acceptor.context()).map_err(|err| ProxyError::Tls(err.into()))?;
    let mut stream = SslStream::new(ssl, io).map_err(|err| ProxyError::Tls(err.into()))?;
    Pin::new(&mut stream)
        .accept()
        .await
        .map_err(|err| ProxyError::Runtime(err.to_string()))?;
    Ok(stream)
}

async fn forward(
    state: &ProxyState,
    ctx: ExchangeContext,
    mut req: ProxyRequest,
    tunnel: Option<&Authority>,
) -> ProxyResponse {
    if let Err(err) = resolve_target(&mut req, tunnel) {
        warn!(exchange = %ctx.id(), error = %err, "unresolvable request target");
        return error_response(StatusCode::BAD_REQUEST);
    }

    let headers = req.headers_mut();
    headers.remove(X_FORWARDED_FOR);
    strip_hop_by_hop(headers);
    restrict_accept_encoding(headers);

    let req = match state.pipeline.modify_request(ctx.clone(), req).await {
        Ok(req) => req,
        Err(err) => return pipeline_failure(&ctx, err),
    };

    let forwarded = ForwardedRequest {
        method: req.method().clone(),
        uri: req.uri().clone(),
    };
    let extensions = req.extensions().clone();
    debug!(exchange = %ctx.id(), method = %forwarded.method, uri = %forwarded.uri, "forwarding request");

    let res = match state.upstream.round_trip(ctx.clone(), req).await {
        Ok(res) => res,
        Err(UpstreamError::Cancelled) => {
            debug!(exchange = %ctx.id(), "round-trip cancelled");
            return error_response(StatusCode::BAD_GATEWAY);
        }
        Err(err) => {
            error!(exchange = %ctx.id(), uri = %forwarded.uri, error = %err, "round-trip failed");
            return error_response(StatusCode::BAD_GATEWAY);
        }
    };

    let (mut parts, body) = res.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    parts.extensions.extend(extensions);
    parts.extensions.insert(forwarded);
    let mut res = Response::from_parts(parts, body);

    if state.decode_gzip {
        res = match gunzip_response(res).await {
            Ok(res) => res,
            Err(err) => return pipeline_failure(&ctx, err),
        };
    }

    match state.pipeline.modify_response(ctx.clone(), res).await {
        Ok(res) => res,
        Err(err) => pipeline_failure(&ctx, err),
    }
}

fn pipeline_failure(ctx: &ExchangeContext, err: ModifyError) -> ProxyResponse {
    if err.is_termination() {
        debug!(exchange = %ctx.id(), reason = %err, "exchange terminated");
    } else {
        error!(exchange = %ctx.id(), error = %err, "modifier failed");
    }
    error_response(StatusCode::BAD_GATEWAY)
}

fn error_response(status: StatusCode) -> ProxyResponse {
    let mut res = Response::new(empty_body());
    *res.status_mut() = status;
    res
}

/// Makes the request target absolute. Tunneled requests are `https` to the
/// CONNECT target; plain requests keep an absolute target or fall back to the
/// `Host` header.
fn resolve_target(req: &mut ProxyRequest, tunnel: Option<&Authority>) -> Result<(), ProxyError> {
    let (scheme, authority) = match tunnel {
        Some(authority) => (Scheme::HTTPS, without_default_port(authority, 443)?),
        None => match (req.uri().scheme(), req.uri().authority()) {
            (Some(_), Some(_)) => return Ok(()),
            _ => {
                let host = req
                    .headers()
                    .get(HOST)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| ProxyError::Runtime("request has no host".to_string()))?;
                let authority = Authority::try_from(host)
                    .map_err(|err| ProxyError::Runtime(format!("invalid host {host:?}: {err}")))?;
                (Scheme::HTTP, authority)
            }
        },
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    *req.uri_mut() = Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|err| ProxyError::Runtime(err.to_string()))?;
    Ok(())
}

fn without_default_port(authority: &Authority, default_port: u16) -> Result<Authority, ProxyError> {
    if authority.port_u16() != Some(default_port) {
        return Ok(authority.clone());
    }
    Authority::try_from(authority.host()).map_err(|err| ProxyError::Runtime(err.to_string()))
}

#[cfg(test)]
mod tests {
    use http::uri::Authority;
    use http::{Request, Uri};

    use super::resolve_target;
    use crate::modify::{ProxyRequest, empty_body};

    fn request(uri: &str, host: Option<&str>) -> ProxyRequest {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header("host", host);
        }
        builder.body(empty_body()).unwrap()
    }

    #[test]
    fn tunneled_requests_use_https_and_connect_target() {
        let mut req = request("/path?q=1", Some("ignored.test"));
        let authority = Authority::from_static("example.com:443");
        resolve_target(&mut req, Some(&authority)).unwrap();
        assert_eq!(req.uri(), &Uri::from_static("https://example.com/path?q=1"));
    }

    #[test]
    fn tunneled_requests_keep_custom_port() {
        let mut req = request("/", None);
        let authority = Authority::from_static("example.com:8443");
        resolve_target(&mut req, Some(&authority)).unwrap();
        assert_eq!(req.uri(), &Uri::from_static("https://example.com:8443/"));
    }

    #[test]
    fn absolute_form_is_kept() {
        let mut req = request("http://example.com:8080/a", Some("other.test"));
        resolve_target(&mut req, None).unwrap();
        assert_eq!(req.uri(), &Uri::from_static("http://example.com:8080/a"));
    }

    #[test]
    fn origin_form_uses_host_header() {
        let mut req = request("/a", Some("example.com"));
        resolve_target(&mut req, None).unwrap();
        assert_eq!(req.uri(), &Uri::from_static("http://example.com/a"));
    }

    #[test]
    fn missing_host_is_rejected() {
        let mut req = request("/a", None);
        assert!(resolve_target(&mut req, None).is_err());
    }
}
