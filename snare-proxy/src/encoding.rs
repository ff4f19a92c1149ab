use std::io::Read;

use flate2::read::GzDecoder;
use http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HeaderName, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, HeaderValue, Response};

use crate::error::ModifyError;
use crate::modify::{ProxyResponse, buffer_response, full_body};

const PROXY_CONNECTION: &str = "proxy-connection";
const KEEP_ALIVE: &str = "keep-alive";

/// Removes headers that only apply to a single transport hop, including any
/// named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [
        CONNECTION,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove(PROXY_CONNECTION);
    headers.remove(KEEP_ALIVE);
}

/// Keeps only the `gzip` and `*` directives of `Accept-Encoding`, dropping
/// the header when none remain.
pub fn restrict_accept_encoding(headers: &mut HeaderMap) {
    let kept: Vec<String> = headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|directive| {
            let coding = directive.split(';').next().unwrap_or_default().trim();
            coding.eq_ignore_ascii_case("gzip") || coding == "*"
        })
        .map(str::to_string)
        .collect();

    headers.remove(ACCEPT_ENCODING);
    if kept.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&kept.join(", ")) {
        headers.insert(ACCEPT_ENCODING, value);
    }
}

pub fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("gzip"))
}

/// Decodes a gzip response body in place. Other encodings, and empty bodies
/// such as HEAD responses, pass through untouched.
pub async fn gunzip_response(res: ProxyResponse) -> Result<ProxyResponse, ModifyError> {
    if !is_gzip(res.headers()) {
        return Ok(res);
    }

    let (mut parts, body) = buffer_response(res).await?.into_parts();
    if body.is_empty() {
        return Ok(Response::from_parts(parts, full_body(body)));
    }

    let mut decoded = Vec::new();
    GzDecoder::new(body.as_ref())
        .read_to_end(&mut decoded)
        .map_err(|err| ModifyError::Decode(err.to_string()))?;

    parts.headers.remove(CONTENT_ENCODING);
    parts.headers.remove(TRANSFER_ENCODING);
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(decoded.len()));
    Ok(Response::from_parts(parts, full_body(decoded)))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use http::{HeaderMap, HeaderValue, Response};

    use super::*;

    fn gzip(input: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(input).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn strips_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-kept", HeaderValue::from_static("1"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-kept"));
    }

    #[test]
    fn accept_encoding_keeps_gzip_only() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "accept-encoding",
            HeaderValue::from_static("gzip;q=1.0, deflate, br, *;q=0.1"),
        );
        restrict_accept_encoding(&mut headers);
        assert_eq!(headers["accept-encoding"], "gzip;q=1.0, *;q=0.1");
    }

    #[test]
    fn accept_encoding_removed_when_unsupported() {
        let mut headers = HeaderMap::new();
        headers.insert("accept-encoding", HeaderValue::from_static("br, zstd"));
        restrict_accept_encoding(&mut headers);
        assert!(!headers.contains_key("accept-encoding"));
    }

    #[tokio::test]
    async fn gzip_body_is_decoded() {
        let res = Response::builder()
            .header("content-encoding", "gzip")
            .header("content-length", "999")
            .body(full_body(gzip(b"hello gzip")))
            .unwrap();

        let res = gunzip_response(res).await.unwrap();
        assert!(!res.headers().contains_key("content-encoding"));
        assert_eq!(res.headers()["content-length"], "10");
        let res = buffer_response(res).await.unwrap();
        assert_eq!(res.body().as_ref(), b"hello gzip");
    }

    #[tokio::test]
    async fn invalid_gzip_is_decode_error() {
        let res = Response::builder()
            .header("content-encoding", "gzip")
            .body(full_body("not gzip"))
            .unwrap();
        let err = gunzip_response(res).await.unwrap_err();
        assert_matches!(err, ModifyError::Decode(_));
    }

    #[tokio::test]
    async fn identity_body_passes_through() {
        let res = Response::builder().body(full_body("plain")).unwrap();
        let res = gunzip_response(res).await.unwrap();
        let res = buffer_response(res).await.unwrap();
        assert_eq!(res.body().as_ref(), b"plain");
    }
}
