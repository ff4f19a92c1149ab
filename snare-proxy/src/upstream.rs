use std::pin::Pin;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use http::header::HOST;
use http::uri::{Parts, PathAndQuery, Scheme};
use http::{HeaderValue, Uri};
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use openssl::ssl::SslConnector;
use snare_net::build_connector;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::ProxyError;
use crate::exchange::ExchangeContext;
use crate::modify::{BoxError, ProxyRequest, ProxyResponse};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("round-trip cancelled")]
    Cancelled,
    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),
    #[error("upstream connect failed: {0}")]
    Connect(String),
    #[error("upstream connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream TLS failed: {0}")]
    Tls(String),
    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Sends one request to its destination and returns the response.
pub trait Upstream: Send + Sync {
    fn round_trip(
        &self,
        ctx: ExchangeContext,
        req: ProxyRequest,
    ) -> BoxFuture<'static, Result<ProxyResponse, UpstreamError>>;
}

/// HTTP/1.1 transport opening a fresh connection per exchange.
#[derive(Clone)]
pub struct HttpUpstream {
    connect_timeout: Duration,
    connector: SslConnector,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            connect_timeout: config.connect_timeout(),
            connector: build_connector(config.verify_tls)?,
        })
    }
}

impl Upstream for HttpUpstream {
    fn round_trip(
        &self,
        ctx: ExchangeContext,
        req: ProxyRequest,
    ) -> BoxFuture<'static, Result<ProxyResponse, UpstreamError>> {
        let upstream = self.clone();
        async move {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => Err(UpstreamError::Cancelled),
                result = upstream.send(req) => result,
            }
        }
        .boxed()
    }
}

impl HttpUpstream {
    async fn send(&self, mut req: ProxyRequest) -> Result<ProxyResponse, UpstreamError> {
        let uri = req.uri().clone();
        let https = uri.scheme() == Some(&Scheme::HTTPS);
        let authority = uri
            .authority()
            .ok_or_else(|| UpstreamError::InvalidTarget(uri.to_string()))?
            .clone();
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or(if https { 443 } else { 80 });

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| UpstreamError::Timeout(self.connect_timeout))?
            .map_err(|err| UpstreamError::Connect(format!("{authority}: {err}")))?;
        if let Err(err) = tcp.set_nodelay(true) {
            debug!(%authority, error = %err, "set_nodelay failed");
        }

        if !req.headers().contains_key(HOST) {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|err| UpstreamError::InvalidTarget(err.to_string()))?;
            req.headers_mut().insert(HOST, value);
        }
        *req.uri_mut() = origin_form(&uri)?;

        debug!(%authority, https, "upstream connected");

        if https {
            let ssl = self
                .connector
                .configure()
                .and_then(|config| config.into_ssl(&host))
                .map_err(|err| UpstreamError::Tls(err.to_string()))?;
            let mut stream =
                SslStream::new(ssl, tcp).map_err(|err| UpstreamError::Tls(err.to_string()))?;
            Pin::new(&mut stream)
                .connect()
                .await
                .map_err(|err| UpstreamError::Tls(err.to_string()))?;
            exchange(TokioIo::new(stream), req).await
        } else {
            exchange(TokioIo::new(tcp), req).await
        }
    }
}

async fn exchange<IO>(io: IO, req: ProxyRequest) -> Result<ProxyResponse, UpstreamError>
where
    IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(error = %err, "upstream connection closed");
        }
    });

    let res = sender.send_request(req).await?;
    Ok(res.map(|body| body.map_err(BoxError::from).boxed()))
}

fn origin_form(uri: &Uri) -> Result<Uri, UpstreamError> {
    let mut parts = Parts::default();
    parts.path_and_query = Some(
        uri.path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/")),
    );
    Uri::from_parts(parts).map_err(|err| UpstreamError::InvalidTarget(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::origin_form;

    #[test]
    fn origin_form_keeps_path_and_query() {
        let uri = "https://example.com:8443/a/b?c=d".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/a/b?c=d");
    }

    #[test]
    fn origin_form_defaults_to_root() {
        let uri = "http://example.com".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/");
    }
}
