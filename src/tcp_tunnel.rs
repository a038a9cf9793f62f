use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chain;
use crate::proxy_url::{ProxyUrl, UrlError};
use crate::stats::TrafficCounters;
use crate::tunnel;

const TUNNEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for TCP tunnel front-ends
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Url(#[from] UrlError),

    #[error("invalid tunnel target '{0}', expected host:port")]
    InvalidTarget(String),

    #[error("failed to bind the local tunnel listener: {0}")]
    Bind(#[source] io::Error),
}

struct TunnelHandle {
    accept_cancel: CancellationToken,
    conns_cancel: CancellationToken,
    accept: JoinHandle<()>,
    active: Arc<ActiveConns>,
}

#[derive(Default)]
struct ActiveConns {
    count: AtomicUsize,
    drained: Notify,
}

/// Process-wide registry of tunnel listeners keyed by local endpoint
static REGISTRY: OnceLock<Mutex<HashMap<String, TunnelHandle>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, TunnelHandle>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn validate_target(target: &str) -> Result<(), TunnelError> {
    let invalid = || TunnelError::InvalidTarget(target.to_string());
    let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(()),
        _ => Err(invalid()),
    }
}

/// Open a local TCP listener that front-ends a CONNECT tunnel to `target`
/// through the HTTP proxy at `proxy_url`.
///
/// Every accepted connection performs a fresh client-role CONNECT handshake
/// (with Basic auth when the proxy URL carries credentials) and then relays
/// bytes opaquely. Returns the `127.0.0.1:port` endpoint to connect to.
pub async fn create_tunnel(proxy_url: &str, target: &str) -> Result<String, TunnelError> {
    let upstream = ProxyUrl::parse(proxy_url)?;
    validate_target(target)?;

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .map_err(TunnelError::Bind)?;
    let endpoint = listener.local_addr().map_err(TunnelError::Bind)?.to_string();

    let accept_cancel = CancellationToken::new();
    let conns_cancel = CancellationToken::new();
    let active = Arc::new(ActiveConns::default());
    let accept = tokio::spawn(accept_loop(
        listener,
        upstream,
        target.to_string(),
        accept_cancel.clone(),
        conns_cancel.clone(),
        active.clone(),
    ));

    registry().lock().unwrap().insert(
        endpoint.clone(),
        TunnelHandle {
            accept_cancel,
            conns_cancel,
            accept,
            active,
        },
    );
    debug!(%endpoint, target, "tunnel listener ready");
    Ok(endpoint)
}

/// Tear down a tunnel created by [`create_tunnel`].
///
/// The registry entry is removed first, then acceptance stops; with `force`
/// the in-flight relays are destroyed as well, otherwise they drain
/// naturally. Returns `false` when the endpoint was not registered.
pub async fn close_tunnel(endpoint: &str, force: bool) -> bool {
    let handle = registry().lock().unwrap().remove(endpoint);
    let Some(handle) = handle else {
        return false;
    };

    handle.accept_cancel.cancel();
    let _ = handle.accept.await;
    if force {
        handle.conns_cancel.cancel();
    }

    loop {
        let drained = handle.active.drained.notified();
        tokio::pin!(drained);
        // Register before checking so a wakeup between the check and the
        // await cannot be missed.
        drained.as_mut().enable();
        if handle.active.count.load(Ordering::SeqCst) == 0 {
            break;
        }
        drained.await;
    }
    true
}

async fn accept_loop(
    listener: TcpListener,
    upstream: ProxyUrl,
    target: String,
    accept_cancel: CancellationToken,
    conns_cancel: CancellationToken,
    active: Arc<ActiveConns>,
) {
    loop {
        let accepted = tokio::select! {
            _ = accept_cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((client, peer)) => {
                debug!(%peer, target, "tunnel client accepted");
                active.count.fetch_add(1, Ordering::SeqCst);
                let upstream = upstream.clone();
                let target = target.clone();
                let cancel = conns_cancel.child_token();
                let active = active.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_tunnel_client(client, &upstream, &target, cancel).await
                    {
                        debug!(target, "tunnel connection ended: {err}");
                    }
                    if active.count.fetch_sub(1, Ordering::SeqCst) == 1 {
                        active.drained.notify_waiters();
                    }
                });
            }
            Err(err) => {
                warn!("tunnel accept error: {err} (continuing)");
            }
        }
    }
}

async fn serve_tunnel_client(
    client: TcpStream,
    upstream: &ProxyUrl,
    target: &str,
    cancel: CancellationToken,
) -> io::Result<()> {
    let (server, initial) = chain::connect_via_upstream(
        upstream,
        target,
        TUNNEL_CONNECT_TIMEOUT,
        TUNNEL_CONNECT_TIMEOUT,
    )
    .await
    .map_err(io::Error::other)?;

    tunnel::pump(
        client,
        server,
        initial,
        Arc::new(TrafficCounters::default()),
        cancel,
        None,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_tunnel_targets() {
        assert!(validate_target("example.com:443").is_ok());
        assert!(validate_target("127.0.0.1:8080").is_ok());

        assert!(validate_target("example.com").is_err());
        assert!(validate_target(":443").is_err());
        assert!(validate_target("example.com:0").is_err());
        assert!(validate_target("example.com:notaport").is_err());
    }
}
