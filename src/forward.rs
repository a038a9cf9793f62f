use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, PROXY_AUTHORIZATION, UPGRADE};
use http::{StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::chain::basic_auth_value;
use crate::handler::status_response;
use crate::proxy_url::ProxyUrl;
use crate::server::ConnState;
use crate::tunnel;

/// Headers that never travel across a proxy hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Strip hop-by-hop headers, plus any header the Connection header names.
///
/// When `keep_upgrade` is set the Upgrade header survives and a fresh
/// `Connection: upgrade` is emitted so the next hop honors the switch.
/// Message framing is re-derived by hyper from the body, so dropping
/// `Transfer-Encoding` here is safe.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let mut named: Vec<String> = Vec::new();
    for value in headers.get_all(CONNECTION) {
        if let Ok(value) = value.to_str() {
            named.extend(
                value
                    .split(',')
                    .map(|token| token.trim().to_ascii_lowercase())
                    .filter(|token| !token.is_empty()),
            );
        }
    }

    let upgrade_value = if keep_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    };

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in named {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(name);
        }
    }

    if let Some(value) = upgrade_value {
        headers.insert(UPGRADE, value);
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    }
}

fn connection_names_upgrade(headers: &HeaderMap) -> bool {
    headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false)
    })
}

/// Relay one plain HTTP exchange, directly to the target or through an
/// upstream proxy, stripping hop-by-hop headers in both directions.
///
/// When the origin answers `101 Switching Protocols` the exchange turns into
/// an opaque byte pump between the two upgraded connections.
pub(crate) async fn handle_forward(
    conn: Arc<ConnState>,
    connect_timeout: Duration,
    mut req: Request<Incoming>,
    host: String,
    port: u16,
    upstream: Option<ProxyUrl>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let client_upgrade = hyper::upgrade::on(&mut req);
    let wants_upgrade =
        connection_names_upgrade(req.headers()) && req.headers().contains_key(UPGRADE);

    // Chained exchanges keep the absolute-form request target; direct ones
    // are rewritten to origin-form.
    let addr = match &upstream {
        Some(upstream) => upstream.authority(),
        None => format!("{host}:{port}"),
    };
    if upstream.is_none() {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        *req.uri_mut() = path.parse::<Uri>().unwrap_or_else(|_| Uri::from_static("/"));
    }

    strip_hop_by_hop(req.headers_mut(), wants_upgrade);
    if let Some(upstream) = &upstream {
        if upstream.has_credentials() {
            req.headers_mut().insert(
                PROXY_AUTHORIZATION,
                basic_auth_value(&upstream.username, &upstream.password),
            );
        }
    }

    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(%addr, "outbound connect failed: {err}");
            return Ok(status_response(
                StatusCode::BAD_GATEWAY,
                "Failed to reach the target",
            ));
        }
        Err(_) => {
            warn!(%addr, "outbound connect timed out");
            return Ok(status_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Timed out reaching the target",
            ));
        }
    };

    let io = TokioIo::new(stream);
    let (mut sender, driver) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await?;

    let driver_id = conn.id;
    tokio::spawn(async move {
        if let Err(err) = driver.with_upgrades().await {
            let msg = err.to_string();
            if !msg.contains("connection closed") {
                debug!(id = driver_id, "outbound connection error: {msg}");
            }
        }
    });

    let request_counters = conn.counters.clone();
    let outbound = req.map(move |body| {
        body.map_frame(move |frame| {
            if let Some(data) = frame.data_ref() {
                request_counters.add_from_client(data.len() as u64);
            }
            frame
        })
        .boxed()
    });

    let mut response = match sender.send_request(outbound).await {
        Ok(response) => response,
        Err(err) => {
            warn!(%addr, "upstream exchange failed: {err}");
            return Ok(status_response(
                StatusCode::BAD_GATEWAY,
                "Upstream exchange failed",
            ));
        }
    };

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let server_upgrade = hyper::upgrade::on(&mut response);
        let counters = conn.counters.clone();
        let cancel = conn.cancel.clone();
        let handle = tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, server_upgrade) {
                Ok((client, server)) => {
                    let client = TokioIo::new(client);
                    let server = TokioIo::new(server);
                    if let Err(err) =
                        tunnel::pump(client, server, Bytes::new(), counters, cancel, None).await
                    {
                        debug!("upgraded relay ended: {err}");
                    }
                }
                Err(err) => warn!("protocol upgrade failed: {err}"),
            }
        });
        conn.set_pump(handle);

        strip_hop_by_hop(response.headers_mut(), true);
        return Ok(response.map(|body| body.boxed()));
    }

    strip_hop_by_hop(response.headers_mut(), false);
    let response_counters = conn.counters.clone();
    Ok(response.map(move |body| {
        body.map_frame(move |frame| {
            if let Some(data) = frame.data_ref() {
                response_counters.add_to_client(data.len() as u64);
            }
            frame
        })
        .boxed()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn strips_the_canonical_hop_by_hop_set() {
        let mut map = headers(&[
            ("host", "example.com"),
            ("proxy-authorization", "Basic dTpw"),
            ("proxy-connection", "keep-alive"),
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("te", "trailers"),
            ("trailer", "Expires"),
            ("upgrade", "websocket"),
            ("accept", "*/*"),
        ]);

        strip_hop_by_hop(&mut map, false);

        assert_eq!(map.len(), 2);
        assert!(map.contains_key("host"));
        assert!(map.contains_key("accept"));
    }

    #[test]
    fn strips_headers_named_by_the_connection_header() {
        let mut map = headers(&[
            ("connection", "close, x-tracking-id"),
            ("x-tracking-id", "abc"),
            ("x-kept", "yes"),
        ]);

        strip_hop_by_hop(&mut map, false);

        assert!(!map.contains_key("x-tracking-id"));
        assert!(map.contains_key("x-kept"));
    }

    #[test]
    fn keep_upgrade_preserves_the_upgrade_header() {
        let mut map = headers(&[
            ("connection", "upgrade"),
            ("upgrade", "websocket"),
            ("sec-websocket-key", "xyz"),
        ]);

        strip_hop_by_hop(&mut map, true);

        assert_eq!(map.get(UPGRADE).unwrap(), "websocket");
        assert_eq!(map.get(CONNECTION).unwrap(), "upgrade");
        assert!(map.contains_key("sec-websocket-key"));
    }

    #[test]
    fn detects_upgrade_intent_from_the_connection_header() {
        let with = headers(&[("connection", "keep-alive, Upgrade"), ("upgrade", "websocket")]);
        let without = headers(&[("connection", "keep-alive")]);

        assert!(connection_names_upgrade(&with));
        assert!(!connection_names_upgrade(&without));
    }
}
