use std::io::Write;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use assert_matches::assert_matches;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::FutureExt;
use futures::future::BoxFuture;
use http::{Response, Uri};
use openssl::ssl::{SslConnector, SslMethod};
use openssl::x509::X509;
use parking_lot::Mutex;
use snare_net::{LeafIssuer, generate_ca};
use snare_proxy::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;

fn issuer() -> Arc<LeafIssuer> {
    Arc::new(LeafIssuer::new(generate_ca("Snare Test CA").unwrap()).unwrap())
}

async fn start(proxy: Proxy) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { proxy.run(listener, token).await });
    (addr, shutdown)
}

/// Origin server answering every connection with `response` and reporting
/// the request head it received.
async fn spawn_origin(response: Vec<u8>) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let (head, _) = read_head(&mut stream).await;
            let _ = sender.send(head);
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        }
    });
    (addr, receiver)
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
            let rest = buffer.split_off(end + 4);
            return (String::from_utf8(buffer).unwrap(), rest);
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before end of head");
        buffer.extend_from_slice(&chunk[..n]);
    }
}

async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let (head, mut body) = read_head(stream).await;
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while body.len() < length {
        let mut chunk = vec![0u8; length - body.len()];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before end of body");
        body.extend_from_slice(&chunk[..n]);
    }
    (head, body)
}

fn has_header(head: &str, name: &str, value: &str) -> bool {
    head.lines().any(|line| {
        line.split_once(':').is_some_and(|(n, v)| {
            n.trim().eq_ignore_ascii_case(name) && v.trim() == value
        })
    })
}

fn lacks_header(head: &str, name: &str) -> bool {
    !head.lines().any(|line| {
        line.split_once(':')
            .is_some_and(|(n, _)| n.trim().eq_ignore_ascii_case(name))
    })
}

const HELLO: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

/// Opens a CONNECT tunnel through the proxy and completes a TLS handshake
/// for `host`, trusting only `issuer`'s root.
async fn open_tunnel(proxy: SocketAddr, issuer: &LeafIssuer, host: &str) -> SslStream<TcpStream> {
    let mut tcp = TcpStream::connect(proxy).await.unwrap();
    tcp.write_all(format!("CONNECT {host}:443 HTTP/1.1\r\nHost: {host}:443\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let (head, _) = read_response(&mut tcp).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected CONNECT reply: {head}");

    let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
    let root = X509::from_der(&issuer.ca().material.cert_der).unwrap();
    builder.cert_store_mut().add_cert(root).unwrap();
    let ssl = builder.build().configure().unwrap().into_ssl(host).unwrap();
    let mut tls = SslStream::new(ssl, tcp).unwrap();
    Pin::new(&mut tls).connect().await.unwrap();
    tls
}

async fn send<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, raw: &str) -> (String, Vec<u8>) {
    stream.write_all(raw.as_bytes()).await.unwrap();
    read_response(stream).await
}

#[derive(Default)]
struct RecordingUpstream {
    seen: Mutex<Vec<Uri>>,
}

impl Upstream for RecordingUpstream {
    fn round_trip(
        &self,
        _ctx: ExchangeContext,
        req: ProxyRequest,
    ) -> BoxFuture<'static, Result<ProxyResponse, UpstreamError>> {
        self.seen.lock().push(req.uri().clone());
        async { Ok(Response::new(full_body("ok"))) }.boxed()
    }
}

/// Sends every request to a fixed local origin over plain HTTP, keeping the
/// path.
struct RedirectingUpstream {
    origin: SocketAddr,
    inner: HttpUpstream,
}

impl Upstream for RedirectingUpstream {
    fn round_trip(
        &self,
        ctx: ExchangeContext,
        mut req: ProxyRequest,
    ) -> BoxFuture<'static, Result<ProxyResponse, UpstreamError>> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        *req.uri_mut() = format!("http://{}{}", self.origin, path).parse().unwrap();
        self.inner.round_trip(ctx, req)
    }
}

#[tokio::test]
async fn plain_request_is_forwarded_without_forwarded_for() {
    let (origin, mut heads) = spawn_origin(HELLO.to_vec()).await;
    let proxy = Proxy::builder(issuer()).build().unwrap();
    let (addr, shutdown) = start(proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (head, body) = send(
        &mut client,
        &format!(
            "GET http://{origin}/path?x=1 HTTP/1.1\r\nHost: {origin}\r\nX-Forwarded-For: 10.0.0.1\r\nProxy-Connection: keep-alive\r\n\r\n"
        ),
    )
    .await;

    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"hello");

    let seen = heads.recv().await.unwrap();
    assert!(seen.starts_with("GET /path?x=1 HTTP/1.1"), "{seen}");
    assert!(lacks_header(&seen, "x-forwarded-for"), "{seen}");
    assert!(lacks_header(&seen, "proxy-connection"), "{seen}");
    shutdown.cancel();
}

#[tokio::test]
async fn tunneled_request_reaches_pipeline_once_as_https() {
    let issuer = issuer();
    let upstream = Arc::new(RecordingUpstream::default());
    let proxy = Proxy::builder(issuer.clone())
        .upstream(upstream.clone())
        .build()
        .unwrap();
    let (addr, shutdown) = start(proxy).await;

    let mut tls = open_tunnel(addr, &issuer, "example.com").await;
    let (head, body) = send(&mut tls, "GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n").await;

    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"ok");
    assert_eq!(
        *upstream.seen.lock(),
        vec![Uri::from_static("https://example.com/path")]
    );
    shutdown.cancel();
}

#[tokio::test]
async fn operator_edit_reaches_destination() {
    let issuer = issuer();
    let (origin, mut heads) = spawn_origin(HELLO.to_vec()).await;
    let service = Arc::new(InterceptService::new(InterceptSettings {
        requests_enabled: true,
        ..Default::default()
    }));
    let upstream = RedirectingUpstream {
        origin,
        inner: HttpUpstream::new(&UpstreamConfig::default()).unwrap(),
    };
    let proxy = Proxy::builder(issuer.clone())
        .upstream(Arc::new(upstream))
        .request_modifier(service.request_modifier())
        .response_modifier(service.response_modifier())
        .build()
        .unwrap();
    let (addr, shutdown) = start(proxy).await;

    let operator = {
        let service = service.clone();
        tokio::spawn(async move {
            let item = loop {
                if let Some(item) = service.items().into_iter().next() {
                    break item;
                }
                tokio::task::yield_now().await;
            };
            let pending = item.request.unwrap();
            assert_eq!(pending.uri(), "https://example.com/path");
            let mut edited = duplicate_request(&pending);
            edited
                .headers_mut()
                .insert("x-snare", http::HeaderValue::from_static("intercepted"));
            service.modify_request(item.id, edited, None).unwrap();
        })
    };

    let mut tls = open_tunnel(addr, &issuer, "example.com").await;
    let (head, body) = send(&mut tls, "GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
    operator.await.unwrap();

    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"hello");
    let seen = heads.recv().await.unwrap();
    assert!(has_header(&seen, "x-snare", "intercepted"), "{seen}");
    assert!(service.items().is_empty());
    shutdown.cancel();
}

#[tokio::test]
async fn dropped_request_gets_bad_gateway() {
    let service = Arc::new(InterceptService::new(InterceptSettings {
        requests_enabled: true,
        ..Default::default()
    }));
    let upstream = Arc::new(RecordingUpstream::default());
    let proxy = Proxy::builder(issuer())
        .upstream(upstream.clone())
        .request_modifier(service.request_modifier())
        .build()
        .unwrap();
    let (addr, shutdown) = start(proxy).await;

    let operator = {
        let service = service.clone();
        tokio::spawn(async move {
            let id = loop {
                if let Some(item) = service.items().into_iter().next() {
                    break item.id;
                }
                tokio::task::yield_now().await;
            };
            service.cancel_request(id).unwrap();
        })
    };

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (head, _) = send(
        &mut client,
        "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n",
    )
    .await;
    operator.await.unwrap();

    assert!(head.starts_with("HTTP/1.1 502"), "{head}");
    assert!(upstream.seen.lock().is_empty());
    shutdown.cancel();
}

#[tokio::test]
async fn unreachable_destination_gets_bad_gateway() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let proxy = Proxy::builder(issuer()).build().unwrap();
    let (addr, shutdown) = start(proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (head, _) = send(
        &mut client,
        &format!("GET http://{closed}/ HTTP/1.1\r\nHost: {closed}\r\n\r\n"),
    )
    .await;

    assert!(head.starts_with("HTTP/1.1 502"), "{head}");
    shutdown.cancel();
}

#[tokio::test]
async fn gzip_responses_are_decoded_before_modifiers() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"compressed hello").unwrap();
    let compressed = encoder.finish().unwrap();
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        compressed.len()
    )
    .into_bytes();
    response.extend_from_slice(&compressed);

    let (origin, mut heads) = spawn_origin(response).await;
    let proxy = Proxy::builder(issuer()).build().unwrap();
    let (addr, shutdown) = start(proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (head, body) = send(
        &mut client,
        &format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nAccept-Encoding: br, gzip\r\n\r\n"),
    )
    .await;

    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(lacks_header(&head, "content-encoding"), "{head}");
    assert_eq!(body, b"compressed hello");
    let seen = heads.recv().await.unwrap();
    assert!(has_header(&seen, "accept-encoding", "gzip"), "{seen}");
    shutdown.cancel();
}

#[tokio::test]
async fn client_disconnect_releases_pending_request() {
    let service = Arc::new(InterceptService::new(InterceptSettings {
        requests_enabled: true,
        ..Default::default()
    }));
    let upstream = Arc::new(RecordingUpstream::default());
    let proxy = Proxy::builder(issuer())
        .upstream(upstream.clone())
        .request_modifier(service.request_modifier())
        .build()
        .unwrap();
    let (addr, shutdown) = start(proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let id = loop {
        if let Some(item) = service.items().into_iter().next() {
            break item.id;
        }
        tokio::task::yield_now().await;
    };

    drop(client);
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !service.items().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pending request outlived its client");

    assert_matches!(service.cancel_request(id), Err(InterceptError::NotFound));
    assert!(upstream.seen.lock().is_empty());
    shutdown.cancel();
}
