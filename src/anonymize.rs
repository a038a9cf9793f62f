use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::hook::{Decision, HookArgs, HookError};
use crate::proxy_url::{ProxyUrl, UrlError};
use crate::server::{ProxyServer, ServerError, ServerOptions};

/// Error type for proxy anonymization
#[derive(Debug, thiserror::Error)]
pub enum AnonymizeError {
    #[error(transparent)]
    Url(#[from] UrlError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Process-wide registry of anonymized proxies keyed by the returned URL
static REGISTRY: OnceLock<Mutex<HashMap<String, ProxyServer>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, ProxyServer>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Spawn a local credential-less front for an authenticated upstream proxy.
///
/// Credential-unaware clients point at the returned `http://127.0.0.1:port`
/// URL; every request is chained through `proxy_url` with its credentials
/// injected. URLs without credentials come back unchanged and nothing is
/// registered.
pub async fn anonymize_proxy(proxy_url: &str) -> Result<String, AnonymizeError> {
    let upstream = ProxyUrl::parse(proxy_url)?;
    if !upstream.has_credentials() {
        return Ok(proxy_url.to_string());
    }

    let hook = move |_args: HookArgs<'_>| -> Result<Decision, HookError> {
        Ok(Decision {
            upstream: Some(upstream.clone()),
            ..Decision::default()
        })
    };
    let options = ServerOptions {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..ServerOptions::default()
    };
    let mut server = ProxyServer::with_hook(options, Arc::new(hook));
    let local = server.listen().await?;

    let anonymized = format!("http://{local}");
    registry().lock().unwrap().insert(anonymized.clone(), server);
    debug!(%anonymized, "anonymized upstream proxy");
    Ok(anonymized)
}

/// Close an anonymized proxy previously created by [`anonymize_proxy`].
///
/// The registry entry is removed before the server shuts down, so concurrent
/// closes cannot tear the same server down twice. Returns `false` when the
/// URL was not registered.
pub async fn close_anonymized_proxy(anonymized_url: &str, force: bool) -> bool {
    let server = registry().lock().unwrap().remove(anonymized_url);
    match server {
        Some(mut server) => {
            server.close(force).await;
            true
        }
        None => false,
    }
}
