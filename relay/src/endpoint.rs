//! Tunnel endpoint
//!
//! The one object the application talks to. A passthrough endpoint listens for
//! the handler's TLS connection and calls into it; a handler endpoint dials out
//! and serves the relay service on the connection it established. Exactly one
//! tunnel connection is live at any moment and a replacement fully supersedes
//! the previous one.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatops_shared::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::liveness;
use crate::metrics::RelayMetrics;
use crate::router::RelayHandler;
use crate::rpc::{BoxedIo, RpcCaller, RpcServer};
use crate::service::RelayService;
use crate::shutdown::{ShutdownListener, ShutdownSignal};
use crate::tls::{self, TlsConfig};
use crate::whitelist::Whitelist;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after a failed accept, so a persistent error such as running out of
/// file descriptors does not spin.
pub const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);
/// Connect and disconnect timestamps kept per ring.
pub const HISTORY_CAPACITY: usize = 1000;

/// Role of this process in the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// No tunnel; relayable routes are served directly.
    Off,
    /// Public front node: listens and forwards requests.
    PassThrough,
    /// Private worker: dials out and executes requests.
    Handler,
}

impl Mode {
    pub fn from_flags(passthrough: bool, handler: bool) -> Result<Self> {
        match (passthrough, handler) {
            (true, true) => Err(Error::ConflictingModes),
            (true, false) => Ok(Mode::PassThrough),
            (false, true) => Ok(Mode::Handler),
            (false, false) => Ok(Mode::Off),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Off => "off",
            Mode::PassThrough => "passthrough",
            Mode::Handler => "handler",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
pub(crate) struct ConnectionState {
    pub(crate) connected: bool,
    pub(crate) connect_time: Option<DateTime<Utc>>,
    pub(crate) connect_count: u64,
    /// Bumped on every connect; fences stale disconnect bookkeeping.
    generation: u64,
    connect_times: VecDeque<DateTime<Utc>>,
    disconnect_times: VecDeque<DateTime<Utc>>,
    caller: Option<Arc<RpcCaller>>,
}

fn push_bounded(ring: &mut VecDeque<DateTime<Utc>>, at: DateTime<Utc>) {
    if ring.len() == HISTORY_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(at);
}

pub struct TunnelEndpoint {
    host: String,
    port: u16,
    whitelist: Whitelist,
    mode: Mode,
    tls: TlsConfig,
    check_interval: Duration,
    pub(crate) state: Mutex<ConnectionState>,
    pub(crate) service: Arc<RelayService>,
    rpc_server: Option<RpcServer>,
    pub(crate) metrics: RelayMetrics,
    pub(crate) shutdown: ShutdownSignal,
    closed: AtomicBool,
}

impl TunnelEndpoint {
    /// Validate the configuration and build the relay service. No network
    /// activity happens until [`listen`](Self::listen) or
    /// [`connect`](Self::connect).
    pub fn new(
        host: impl Into<String>,
        port: u16,
        whitelist: &str,
        mode: Mode,
        tls: TlsConfig,
    ) -> Result<Self> {
        match (mode, &tls) {
            (Mode::PassThrough, TlsConfig::Server(_))
            | (Mode::Handler, TlsConfig::Client(_))
            | (Mode::Off, _) => {}
            (mode, tls) => {
                return Err(Error::Tls(format!(
                    "{} mode cannot use a {} TLS config",
                    mode,
                    tls.kind()
                )))
            }
        }
        let whitelist = Whitelist::new(whitelist)?;

        let metrics = RelayMetrics::new();
        let hook_metrics = metrics.clone();
        let service = Arc::new(RelayService::new(move || hook_metrics.count_rpc()));
        let rpc_server = (mode == Mode::Handler).then(|| RpcServer::new(service.clone()));

        Ok(Self {
            host: host.into(),
            port,
            whitelist,
            mode,
            tls,
            check_interval: DEFAULT_CHECK_INTERVAL,
            state: Mutex::new(ConnectionState::default()),
            service,
            rpc_server,
            metrics,
            shutdown: ShutdownSignal::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Heartbeat period. A handler drops a tunnel after twice this long
    /// without a ping.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        // timers reject a zero period
        self.check_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn service(&self) -> &Arc<RelayService> {
        &self.service
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`close`](Self::close) has released the shutdown signal.
    pub fn shutdown_listener(&self) -> ShutdownListener {
        self.shutdown.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    /// Handle for the live tunnel, present only on a connected passthrough.
    pub async fn caller(&self) -> Option<Arc<RpcCaller>> {
        self.state.lock().await.caller.clone()
    }

    pub async fn connect_times(&self) -> Vec<DateTime<Utc>> {
        self.state.lock().await.connect_times.iter().copied().collect()
    }

    pub async fn disconnect_times(&self) -> Vec<DateTime<Utc>> {
        self.state.lock().await.disconnect_times.iter().copied().collect()
    }

    fn bind_host(&self) -> &str {
        if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        }
    }

    fn dial_host(&self) -> &str {
        if self.host.is_empty() {
            "localhost"
        } else {
            &self.host
        }
    }

    fn expect_mode(&self, expected: Mode) -> Result<()> {
        if self.mode == expected {
            Ok(())
        } else {
            Err(Error::WrongMode {
                expected: expected.as_str(),
                actual: self.mode.as_str(),
            })
        }
    }

    /// Register a handler on the private route table. Handler mode only.
    pub async fn register_handler<H: RelayHandler>(&self, path: &str, handler: H) -> Result<()> {
        self.expect_mode(Mode::Handler)?;
        self.service.handle_func(path, Arc::new(handler)).await;
        debug!(path, "registered relayed route");
        Ok(())
    }

    /// Bind the tunnel listener and start accepting in the background.
    /// Passthrough mode only. Returns the bound address.
    pub async fn listen(self: &Arc<Self>) -> Result<SocketAddr> {
        self.expect_mode(Mode::PassThrough)?;
        let TlsConfig::Server(config) = &self.tls else {
            return Err(Error::Tls("listener needs a server TLS config".into()));
        };
        let acceptor = TlsAcceptor::from(config.clone());

        let listener = TcpListener::bind((self.bind_host(), self.port))
            .await
            .map_err(|e| {
                Error::Connection(format!("cannot listen on {}:{}: {}", self.bind_host(), self.port, e))
            })?;
        let addr = listener.local_addr()?;
        info!("tunnel listening on {} (whitelist {})", addr, self.whitelist.as_str());

        let endpoint = self.clone();
        tokio::spawn(async move { endpoint.accept_loop(listener, acceptor).await });
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait() => {
                    info!("tunnel listener closed");
                    return;
                }
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("tunnel accept failed: {}", e);
                    if !pause_after_accept_error(&mut shutdown).await {
                        info!("tunnel listener closed");
                        return;
                    }
                    continue;
                }
            };

            if !self.whitelist.addr_allowed(Some(peer)) {
                warn!(%peer, "rejected tunnel connection: peer not whitelisted");
                continue;
            }

            let io = match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    warn!(%peer, "tunnel handshake failed: {}", e);
                    continue;
                }
                Err(_) => {
                    warn!(%peer, "tunnel handshake timed out");
                    continue;
                }
            };

            info!(%peer, "tunnel connection accepted");
            self.handle_conn(Box::new(io), peer.to_string()).await;
        }
    }

    /// Start the dial loop in the background. Handler mode only.
    pub fn connect(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.expect_mode(Mode::Handler)?;
        let TlsConfig::Client(config) = &self.tls else {
            return Err(Error::Tls("dialer needs a client TLS config".into()));
        };
        let connector = TlsConnector::from(config.clone());

        let endpoint = self.clone();
        Ok(tokio::spawn(async move { endpoint.dial_loop(connector).await }))
    }

    async fn dial_loop(self: Arc<Self>, connector: TlsConnector) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = Backoff::new();
        let target = format!("{}:{}", self.dial_host(), self.port);

        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            if backoff.is_retrying() {
                let delay = backoff.delay();
                debug!(?delay, "waiting before redialing {}", target);
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let dialed = tokio::select! {
                _ = shutdown.wait() => break,
                dialed = self.dial(&connector) => dialed,
            };
            match dialed {
                Ok(io) => {
                    backoff.reset();
                    info!("tunnel connected to {}", target);
                    self.handle_conn(io, target.clone()).await;
                }
                Err(e) => {
                    backoff.record_failure();
                    warn!("tunnel dial failed: {}", e);
                }
            }
        }
        info!("tunnel dialer stopped");
    }

    async fn dial(&self, connector: &TlsConnector) -> Result<BoxedIo> {
        let host = self.dial_host();
        let stream = TcpStream::connect((host, self.port))
            .await
            .map_err(|e| Error::Connection(format!("connect {}:{}: {}", host, self.port, e)))?;
        let name = tls::server_name(host)?;
        let io = timeout(HANDSHAKE_TIMEOUT, connector.connect(name, stream))
            .await
            .map_err(|_| Error::Connection("tls handshake timed out".into()))?
            .map_err(|e| Error::Connection(format!("tls handshake: {}", e)))?;
        Ok(Box::new(io))
    }

    /// Run one tunnel connection until it dies.
    pub(crate) async fn handle_conn(self: &Arc<Self>, io: BoxedIo, peer: String) {
        match self.mode {
            Mode::PassThrough => {
                let caller = Arc::new(RpcCaller::new(io, peer));
                let generation = self.connected(Some(caller.clone())).await;
                liveness::watch_caller(self, &caller).await;
                caller.close().await;
                self.disconnected(generation).await;
            }
            Mode::Handler => {
                let Some(server) = &self.rpc_server else {
                    return;
                };
                let generation = self.connected(None).await;
                self.service.reset_liveness().await;
                tokio::select! {
                    served = server.serve_conn(io) => match served {
                        Ok(()) => info!(%peer, "tunnel closed by peer"),
                        Err(e) => warn!(%peer, "tunnel serve failed: {}", e),
                    },
                    _ = liveness::watch_pings(self) => {}
                }
                self.disconnected(generation).await;
            }
            Mode::Off => {}
        }
    }

    pub(crate) async fn connected(&self, caller: Option<Arc<RpcCaller>>) -> u64 {
        let (generation, previous) = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            state.generation += 1;
            state.connected = true;
            state.connect_time = Some(now);
            state.connect_count += 1;
            push_bounded(&mut state.connect_times, now);
            let previous = std::mem::replace(&mut state.caller, caller);
            (state.generation, previous)
        };
        self.metrics.count_connect();
        if let Some(previous) = previous {
            previous.close().await;
        }
        generation
    }

    pub(crate) async fn disconnected(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            debug!(generation, current = state.generation, "ignoring stale disconnect");
            return;
        }
        state.connected = false;
        state.caller = None;
        push_bounded(&mut state.disconnect_times, Utc::now());
        info!("tunnel disconnected");
    }

    /// Close the live tunnel, if any, and release the shutdown signal.
    /// A second call fails with [`Error::AlreadyClosed`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        if let Some(caller) = self.caller().await {
            caller.close().await;
        }
        self.shutdown.trigger();
        info!("tunnel endpoint closed");
        Ok(())
    }
}

/// Returns `false` if shutdown was released during the pause.
async fn pause_after_accept_error(shutdown: &mut ShutdownListener) -> bool {
    tokio::select! {
        _ = shutdown.wait() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_DELAY) => true,
    }
}
