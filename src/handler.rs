use std::sync::Arc;

use base64::engine::general_purpose;
use base64::Engine;
use bytes::Bytes;
use http::header::{
    HeaderMap, HeaderValue, CONTENT_LENGTH, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION,
    TRANSFER_ENCODING,
};
use http::StatusCode;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::chain;
use crate::forward;
use crate::hook::{CustomResponse, Decision, HookArgs};
use crate::proxy_url::ProxyUrl;
use crate::server::{ConnState, ServerEvent, ServerInner};
use crate::tunnel;

pub(crate) fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn status_response(
    status: StatusCode,
    message: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full(message));
    *response.status_mut() = status;
    response
}

fn auth_challenge(realm: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = status_response(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        "Proxy authentication required",
    );
    let challenge = HeaderValue::from_str(&format!("Basic realm=\"{realm}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic realm=\"proxy\""));
    response.headers_mut().insert(PROXY_AUTHENTICATE, challenge);
    response
}

/// Decode Basic credentials from `Proxy-Authorization`.
///
/// An absent or undecodable header yields empty strings; comparing
/// credentials is the hook's business, not ours.
pub(crate) fn proxy_credentials(headers: &HeaderMap) -> (String, String) {
    let none = || (String::new(), String::new());
    let Some(value) = headers.get(PROXY_AUTHORIZATION) else {
        return none();
    };
    let Ok(value) = value.to_str() else {
        return none();
    };
    let Some(encoded) = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))
    else {
        return none();
    };
    let Ok(decoded) = general_purpose::STANDARD.decode(encoded.trim()) else {
        return none();
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return none();
    };
    match decoded.split_once(':') {
        Some((username, password)) => (username.to_string(), password.to_string()),
        None => (decoded, String::new()),
    }
}

/// Serialize a hook-supplied response. `Content-Length` always reflects the
/// body; a caller-provided `Transfer-Encoding` is dropped.
fn custom_response(custom: &CustomResponse) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full(custom.body.clone()));
    *response.status_mut() = custom.status;
    for (name, value) in &custom.headers {
        response.headers_mut().append(name, value.clone());
    }
    response.headers_mut().remove(TRANSFER_ENCODING);
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(custom.body.len() as u64));
    response
}

/// Extract the target host and port from the request.
///
/// CONNECT requests use the authority-form target and must name a port;
/// everything else must use the absolute-form URI proxies receive, with the
/// port defaulting to 80.
fn request_target(req: &Request<Incoming>) -> Result<(String, u16), &'static str> {
    if req.method() == Method::CONNECT {
        let Some(authority) = req.uri().authority() else {
            return Err("CONNECT target must be host:port");
        };
        let Some(port) = authority.port_u16() else {
            return Err("CONNECT target must include a port");
        };
        Ok((authority.host().to_string(), port))
    } else {
        if req.uri().scheme().is_none() {
            return Err("request target must be an absolute URI");
        }
        let Some(host) = req.uri().host() else {
            return Err("request target is missing a host");
        };
        Ok((host.to_string(), req.uri().port_u16().unwrap_or(80)))
    }
}

/// Drive one client request through decision, auth, and relay.
pub(crate) async fn handle_request(
    inner: Arc<ServerInner>,
    conn: Arc<ConnState>,
    req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let is_http = req.method() != Method::CONNECT;

    inner.emit(ServerEvent::Request {
        id: conn.id,
        method: req.method().to_string(),
        target: req.uri().to_string(),
    });
    if inner.options.verbose {
        info!(id = conn.id, method = %req.method(), target = %req.uri(), "request");
    } else {
        debug!(id = conn.id, method = %req.method(), target = %req.uri(), "request");
    }

    let (host, port) = match request_target(&req) {
        Ok(target) => target,
        Err(reason) => {
            debug!(id = conn.id, target = %req.uri(), "rejecting request: {reason}");
            return Ok(status_response(StatusCode::BAD_REQUEST, reason));
        }
    };

    let decision = match &inner.hook {
        None => Decision::default(),
        Some(hook) => {
            let (username, password) = proxy_credentials(req.headers());
            let args = HookArgs {
                request: &req,
                username,
                password,
                hostname: host.clone(),
                port,
                is_http,
            };
            match hook.decide(args).await {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(id = conn.id, error = %err, "decision hook failed");
                    let status = if is_http {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::BAD_GATEWAY
                    };
                    return Ok(status_response(status, "Decision hook failed"));
                }
            }
        }
    };

    if let Some(status) = decision.fail_with {
        return Ok(status_response(status, reason_body(status)));
    }

    if decision.require_auth {
        return Ok(auth_challenge(&inner.options.realm));
    }

    if decision.custom_response.is_some() && decision.upstream.is_some() {
        warn!(id = conn.id, "decision names both an upstream and a custom response");
        return Ok(status_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Invalid decision",
        ));
    }

    if let Some(custom) = &decision.custom_response {
        if !is_http {
            warn!(id = conn.id, "custom responses cannot answer CONNECT requests");
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                "Custom responses cannot answer CONNECT requests",
            ));
        }
        return Ok(custom_response(custom));
    }

    if is_http {
        forward::handle_forward(
            conn,
            inner.options.connect_timeout,
            req,
            host,
            port,
            decision.upstream,
        )
        .await
    } else {
        handle_connect(inner, conn, req, host, port, decision.upstream).await
    }
}

fn reason_body(status: StatusCode) -> Bytes {
    Bytes::from(
        status
            .canonical_reason()
            .unwrap_or("Request rejected")
            .to_string(),
    )
}

/// Establish the tunnel, then answer `200 Connection Established` and hand
/// the connection to the duplex pump. Failures answer before any success
/// line is written.
async fn handle_connect(
    inner: Arc<ServerInner>,
    conn: Arc<ConnState>,
    req: Request<Incoming>,
    host: String,
    port: u16,
    upstream: Option<ProxyUrl>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let target = format!("{host}:{port}");
    let options = &inner.options;

    let (server_stream, initial) = match &upstream {
        Some(upstream) => {
            match chain::connect_via_upstream(
                upstream,
                &target,
                options.connect_timeout,
                options.chain_handshake_timeout,
            )
            .await
            {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(id = conn.id, %target, error = %err, "CONNECT via upstream failed");
                    let status = if err.is_timeout() {
                        StatusCode::GATEWAY_TIMEOUT
                    } else {
                        StatusCode::BAD_GATEWAY
                    };
                    return Ok(status_response(status, err.to_string()));
                }
            }
        }
        None => {
            match tokio::time::timeout(options.connect_timeout, TcpStream::connect(&target)).await
            {
                Ok(Ok(stream)) => (stream, Bytes::new()),
                Ok(Err(err)) => {
                    warn!(id = conn.id, %target, "failed to reach the target: {err}");
                    return Ok(status_response(
                        StatusCode::BAD_GATEWAY,
                        "Failed to reach the target",
                    ));
                }
                Err(_) => {
                    warn!(id = conn.id, %target, "timed out reaching the target");
                    return Ok(status_response(
                        StatusCode::GATEWAY_TIMEOUT,
                        "Timed out reaching the target",
                    ));
                }
            }
        }
    };

    inner.emit(ServerEvent::TunnelConnected {
        id: conn.id,
        target: target.clone(),
    });

    let counters = conn.counters.clone();
    let cancel = conn.cancel.clone();
    let idle = options.tunnel_idle_timeout;
    let upgrade = hyper::upgrade::on(req);
    let handle = tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                let client = TokioIo::new(upgraded);
                if let Err(err) =
                    tunnel::pump(client, server_stream, initial, counters, cancel, idle).await
                {
                    debug!(%target, "tunnel closed: {err}");
                }
            }
            Err(err) => warn!(%target, "CONNECT upgrade failed: {err}"),
        }
    });
    conn.set_pump(handle);

    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(
            b"Connection Established",
        ));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_authorization_yields_empty_credentials() {
        let headers = HeaderMap::new();
        assert_eq!(proxy_credentials(&headers), (String::new(), String::new()));
    }

    #[test]
    fn decodes_basic_credentials() {
        let mut headers = HeaderMap::new();
        // "u:p"
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic dTpw"));
        assert_eq!(
            proxy_credentials(&headers),
            ("u".to_string(), "p".to_string())
        );
    }

    #[test]
    fn malformed_authorization_yields_empty_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_static("Basic not-base64!!!"),
        );
        assert_eq!(proxy_credentials(&headers), (String::new(), String::new()));

        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_static("Bearer token"),
        );
        assert_eq!(proxy_credentials(&headers), (String::new(), String::new()));
    }

    #[test]
    fn credentials_without_a_colon_become_the_username() {
        let mut headers = HeaderMap::new();
        // "justuser"
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_static("Basic anVzdHVzZXI="),
        );
        assert_eq!(
            proxy_credentials(&headers),
            ("justuser".to_string(), String::new())
        );
    }

    #[test]
    fn custom_response_sets_content_length_and_drops_transfer_encoding() {
        let mut custom = CustomResponse::new(StatusCode::IM_A_TEAPOT, "teapot");
        custom.headers.insert(
            TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        custom.headers
            .insert("x-flavor", HeaderValue::from_static("earl-grey"));

        let response = custom_response(&custom);

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "6");
        assert!(!response.headers().contains_key(TRANSFER_ENCODING));
        assert_eq!(response.headers().get("x-flavor").unwrap(), "earl-grey");
    }

    #[test]
    fn auth_challenge_announces_the_realm() {
        let response = auth_challenge("internal");
        assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            response.headers().get(PROXY_AUTHENTICATE).unwrap(),
            "Basic realm=\"internal\""
        );
    }
}
