use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine;
use bytes::Bytes;
use http::HeaderValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::proxy_url::ProxyUrl;

/// Largest CONNECT response head accepted from an upstream proxy
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Error type for the upstream CONNECT handshake
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("failed to reach upstream proxy: {0}")]
    Connect(#[source] std::io::Error),

    #[error("timed out connecting to upstream proxy")]
    ConnectTimeout,

    #[error("timed out waiting for the upstream CONNECT response")]
    HandshakeTimeout,

    #[error("upstream proxy closed the connection during CONNECT")]
    ClosedEarly,

    #[error("upstream CONNECT response head exceeded {MAX_RESPONSE_HEAD} bytes")]
    ResponseTooLarge,

    #[error("malformed CONNECT response from upstream proxy")]
    Malformed,

    #[error("upstream proxy answered CONNECT with status {0}")]
    Rejected(u16),

    #[error("I/O error during CONNECT handshake: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainError {
    /// Whether the failure was a timeout rather than a refusal
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout | Self::HandshakeTimeout)
    }
}

/// Basic credentials encoded per RFC 7617, marked sensitive so they never
/// show up in header debug output.
pub(crate) fn basic_auth_value(username: &str, password: &str) -> HeaderValue {
    let token = general_purpose::STANDARD.encode(format!("{username}:{password}"));
    let mut value = HeaderValue::from_str(&format!("Basic {token}"))
        .expect("base64 output is a valid header value");
    value.set_sensitive(true);
    value
}

/// Build the client-role CONNECT head sent to an upstream proxy.
fn connect_request(upstream: &ProxyUrl, target: &str) -> String {
    let mut head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if upstream.has_credentials() {
        let token =
            general_purpose::STANDARD.encode(format!("{}:{}", upstream.username, upstream.password));
        head.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    head.push_str("\r\n");
    head
}

/// Open a tunnel to `target` through `upstream`.
///
/// Returns the stream positioned past the CONNECT handshake, plus any tunnel
/// bytes the upstream delivered together with its response head. Callers must
/// hand those bytes to the client before copying; server-speaks-first
/// protocols send them immediately.
pub(crate) async fn connect_via_upstream(
    upstream: &ProxyUrl,
    target: &str,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<(TcpStream, Bytes), ChainError> {
    let addr = upstream.authority();
    let mut stream = timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| ChainError::ConnectTimeout)?
        .map_err(ChainError::Connect)?;

    stream
        .write_all(connect_request(upstream, target).as_bytes())
        .await?;

    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        let n = timeout(handshake_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| ChainError::HandshakeTimeout)??;
        if n == 0 {
            return Err(ChainError::ClosedEarly);
        }
        head.extend_from_slice(&chunk[..n]);
        if let Some(pos) = head.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(ChainError::ResponseTooLarge);
        }
    };

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    let status = match response.parse(&head[..head_end]) {
        Ok(httparse::Status::Complete(_)) => response.code.ok_or(ChainError::Malformed)?,
        Ok(httparse::Status::Partial) | Err(_) => return Err(ChainError::Malformed),
    };
    if !(200..300).contains(&status) {
        return Err(ChainError::Rejected(status));
    }

    debug!(target, upstream = %addr, "CONNECT tunnel established via upstream");
    Ok((stream, Bytes::copy_from_slice(&head[head_end..])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(credentials: bool) -> ProxyUrl {
        let url = if credentials {
            "http://u:p@127.0.0.1:3128"
        } else {
            "http://127.0.0.1:3128"
        };
        ProxyUrl::parse(url).unwrap()
    }

    #[test]
    fn connect_request_carries_target_and_host() {
        let head = connect_request(&upstream(false), "example.com:443");
        assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com:443\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert!(!head.contains("Proxy-Authorization"));
    }

    #[test]
    fn connect_request_injects_upstream_credentials() {
        let head = connect_request(&upstream(true), "example.com:443");
        // "u:p" encodes to dTpw
        assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }

    #[test]
    fn basic_auth_value_is_sensitive() {
        let value = basic_auth_value("u", "p");
        assert!(value.is_sensitive());
        assert_eq!(value.to_str().unwrap(), "Basic dTpw");
    }
}
