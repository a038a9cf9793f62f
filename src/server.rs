use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler;
use crate::hook::DecisionHook;
use crate::stats::{ConnectionStats, TrafficCounters, ACTIVE_CONNECTIONS};

/// hyper's http1 parser needs at least its initial buffer size to work with
const MIN_HEADER_BYTES: usize = 8 * 1024;

/// Error type for server lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already listening")]
    AlreadyListening,
}

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind
    pub host: IpAddr,
    /// Port to listen on; 0 asks the OS for a free port
    pub port: u16,
    /// Log requests at info level instead of debug
    pub verbose: bool,
    /// Realm announced in `407` challenges
    pub realm: String,
    /// Upper bound on the client request head; larger heads answer `431`
    pub max_header_bytes: usize,
    /// How long a client may take to send its request head
    pub client_read_timeout: Duration,
    /// TCP connect timeout toward targets and upstream proxies
    pub connect_timeout: Duration,
    /// How long an upstream proxy may take to answer CONNECT
    pub chain_handshake_timeout: Duration,
    /// Optional read-idle timeout for established tunnels; tunnels never
    /// time out by default
    pub tunnel_idle_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            verbose: false,
            realm: "proxy".to_string(),
            max_header_bytes: 64 * 1024,
            client_read_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            chain_handshake_timeout: Duration::from_secs(30),
            tunnel_idle_timeout: None,
        }
    }
}

/// Lifecycle events published on a broadcast channel; subscribing is
/// optional and lagging subscribers only lose events, never block the
/// engine.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client connection was accepted and registered
    Connection { id: u64, peer: SocketAddr },
    /// A request line and headers were parsed on a connection
    Request {
        id: u64,
        method: String,
        target: String,
    },
    /// A CONNECT tunnel reached its target (directly or via an upstream)
    TunnelConnected { id: u64, target: String },
    /// The connection reached its terminal state and left the registry
    ConnectionClosed { id: u64, stats: ConnectionStats },
}

/// Per-connection state shared between the registry and the handlers
pub(crate) struct ConnState {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
    pub(crate) counters: Arc<TrafficCounters>,
    started: Instant,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConnState {
    /// Attach the byte-pump task spawned after an upgrade so the connection
    /// stays registered until the tunnel drains.
    pub(crate) fn set_pump(&self, handle: JoinHandle<()>) {
        *self.pump.lock().unwrap() = Some(handle);
    }

    fn take_pump(&self) -> Option<JoinHandle<()>> {
        self.pump.lock().unwrap().take()
    }
}

pub(crate) struct ServerInner {
    pub(crate) options: ServerOptions,
    pub(crate) hook: Option<Arc<dyn DecisionHook>>,
    connections: Mutex<HashMap<u64, Arc<ConnState>>>,
    events: broadcast::Sender<ServerEvent>,
    drained: Notify,
    next_id: AtomicU64,
    closing: AtomicBool,
}

impl ServerInner {
    pub(crate) fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

/// Programmable forward HTTP proxy server.
///
/// Construct with [`ProxyServer::new`] or [`ProxyServer::with_hook`], then
/// [`listen`](ProxyServer::listen). Every accepted connection runs the same
/// engine: parse the request, consult the hook, then authenticate, chain,
/// tunnel, forward, or answer directly.
pub struct ProxyServer {
    inner: Arc<ServerInner>,
    accept: Option<JoinHandle<()>>,
    accept_cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
}

impl ProxyServer {
    pub fn new(options: ServerOptions) -> Self {
        Self::build(options, None)
    }

    pub fn with_hook(options: ServerOptions, hook: Arc<dyn DecisionHook>) -> Self {
        Self::build(options, Some(hook))
    }

    fn build(options: ServerOptions, hook: Option<Arc<dyn DecisionHook>>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ServerInner {
                options,
                hook,
                connections: Mutex::new(HashMap::new()),
                events,
                drained: Notify::new(),
                next_id: AtomicU64::new(1),
                closing: AtomicBool::new(false),
            }),
            accept: None,
            accept_cancel: CancellationToken::new(),
            local_addr: None,
        }
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// The bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The bound port, once listening.
    pub fn port(&self) -> Option<u16> {
        self.local_addr.map(|addr| addr.port())
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Bind failures propagate to the caller; a port of 0 reports the
    /// OS-assigned address in the return value.
    pub async fn listen(&mut self) -> Result<SocketAddr, ServerError> {
        if self.accept.is_some() {
            return Err(ServerError::AlreadyListening);
        }
        let addr = SocketAddr::new(self.inner.options.host, self.inner.options.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.local_addr = Some(local);
        info!(%local, "proxy listening");

        let inner = self.inner.clone();
        let cancel = self.accept_cancel.clone();
        self.accept = Some(tokio::spawn(accept_loop(inner, listener, cancel)));
        Ok(local)
    }

    /// Stop the server.
    ///
    /// Acceptance stops either way. With `force` every registered connection
    /// is destroyed, tunnels included; otherwise in-flight exchanges and
    /// tunnels drain naturally. Returns once the registry is empty.
    pub async fn close(&mut self, force: bool) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.accept_cancel.cancel();
        if let Some(handle) = self.accept.take() {
            let _ = handle.await;
        }

        if force {
            // Remove-then-destroy is handled per connection: cancellation
            // makes each task run its own terminal transition.
            let entries: Vec<_> = self
                .inner
                .connections
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            for conn in entries {
                conn.cancel.cancel();
            }
        }

        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            // Register before checking so a wakeup between the check and the
            // await cannot be missed.
            drained.as_mut().enable();
            if self.inner.connections.lock().unwrap().is_empty() {
                break;
            }
            drained.await;
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        // Stop accepting if the caller never closed; in-flight connections
        // finish on their own.
        self.accept_cancel.cancel();
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if inner.closing.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                let conn = Arc::new(ConnState {
                    id,
                    cancel: CancellationToken::new(),
                    counters: Arc::new(TrafficCounters::default()),
                    started: Instant::now(),
                    pump: Mutex::new(None),
                });
                inner.connections.lock().unwrap().insert(id, conn.clone());
                inner.emit(ServerEvent::Connection { id, peer });
                tokio::spawn(serve_client(inner.clone(), conn, stream, peer));
            }
            Err(err) => {
                warn!("accept error: {err} (continuing)");
            }
        }
    }
}

async fn serve_client(
    inner: Arc<ServerInner>,
    conn: Arc<ConnState>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let mut gauge = ACTIVE_CONNECTIONS.guard();
    let io = TokioIo::new(stream);
    let service_inner = inner.clone();
    let service_conn = conn.clone();
    let service = service_fn(move |req| {
        handler::handle_request(service_inner.clone(), service_conn.clone(), req)
    });

    // Single-shot client connections: one exchange, then close.
    let connection = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .keep_alive(false)
        .max_buf_size(inner.options.max_header_bytes.max(MIN_HEADER_BYTES))
        .timer(TokioTimer::new())
        .header_read_timeout(inner.options.client_read_timeout)
        .serve_connection(io, service)
        .with_upgrades();

    tokio::select! {
        _ = conn.cancel.cancelled() => {
            debug!(id = conn.id, %peer, "connection destroyed during shutdown");
        }
        result = connection => {
            if let Err(err) = result {
                let msg = err.to_string();
                if !msg.contains("connection closed") {
                    debug!(id = conn.id, %peer, "client connection error: {msg}");
                }
            }
        }
    }

    // A CONNECT tunnel or protocol upgrade keeps running after hyper hands
    // the socket off; the connection stays registered until it drains.
    if let Some(pump) = conn.take_pump() {
        let _ = pump.await;
    }

    inner.connections.lock().unwrap().remove(&conn.id);
    gauge.decrement();
    let (bytes_from_client, bytes_to_client) = conn.counters.snapshot();
    debug!(
        id = conn.id,
        bytes_from_client,
        bytes_to_client,
        active = ACTIVE_CONNECTIONS.active(),
        "connection closed"
    );
    inner.emit(ServerEvent::ConnectionClosed {
        id: conn.id,
        stats: ConnectionStats {
            bytes_from_client,
            bytes_to_client,
            duration: conn.started.elapsed(),
        },
    });
    inner.drained.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_the_documented_defaults() {
        let options = ServerOptions::default();
        assert_eq!(options.port, 8000);
        assert_eq!(options.realm, "proxy");
        assert!(!options.verbose);
        assert!(options.tunnel_idle_timeout.is_none());
    }

    #[tokio::test]
    async fn listen_reports_the_os_assigned_port() {
        let mut server = ProxyServer::new(ServerOptions {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..ServerOptions::default()
        });
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.port(), Some(addr.port()));
        assert_eq!(server.connection_count(), 0);
        server.close(false).await;
    }

    #[tokio::test]
    async fn listen_twice_is_an_error() {
        let mut server = ProxyServer::new(ServerOptions {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..ServerOptions::default()
        });
        server.listen().await.unwrap();
        assert!(matches!(
            server.listen().await,
            Err(ServerError::AlreadyListening)
        ));
        server.close(true).await;
    }
}
