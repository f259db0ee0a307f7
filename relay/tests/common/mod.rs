#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chatops_relay::tls;
use chatops_relay::{Mode, TlsConfig, TunnelEndpoint};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub const INTERVAL: Duration = Duration::from_millis(100);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("chatops_relay=debug")
        .with_test_writer()
        .try_init();
}

pub fn self_signed() -> Arc<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let der = CertificateDer::from(cert.serialize_der().unwrap());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
    tls::server_config(vec![der], key).unwrap()
}

pub fn insecure_client() -> TlsConfig {
    TlsConfig::Client(tls::client_config(None, true).unwrap())
}

/// Listening passthrough on an ephemeral loopback port.
pub async fn passthrough(whitelist: &str) -> (Arc<TunnelEndpoint>, SocketAddr) {
    let endpoint = TunnelEndpoint::new(
        "127.0.0.1",
        0,
        whitelist,
        Mode::PassThrough,
        TlsConfig::Server(self_signed()),
    )
    .unwrap()
    .with_check_interval(INTERVAL);
    let endpoint = Arc::new(endpoint);
    let addr = endpoint.listen().await.unwrap();
    (endpoint, addr)
}

/// Handler endpoint targeting `addr`, not yet dialing.
pub fn handler(addr: SocketAddr) -> Arc<TunnelEndpoint> {
    let endpoint = TunnelEndpoint::new(
        "127.0.0.1",
        addr.port(),
        ".+",
        Mode::Handler,
        insecure_client(),
    )
    .unwrap()
    .with_check_interval(INTERVAL);
    Arc::new(endpoint)
}

/// Bare TLS session to a passthrough that never serves calls.
pub async fn raw_peer(addr: SocketAddr) -> TlsStream<TcpStream> {
    let connector = TlsConnector::from(tls::client_config(None, true).unwrap());
    let stream = TcpStream::connect(addr).await.unwrap();
    connector
        .connect(tls::server_name("127.0.0.1").unwrap(), stream)
        .await
        .unwrap()
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_connected(endpoint: &Arc<TunnelEndpoint>) -> bool {
    wait_until(Duration::from_secs(5), || {
        let endpoint = endpoint.clone();
        async move { endpoint.is_connected().await }
    })
    .await
}

pub async fn wait_disconnected(endpoint: &Arc<TunnelEndpoint>) -> bool {
    wait_until(Duration::from_secs(5), || {
        let endpoint = endpoint.clone();
        async move { !endpoint.is_connected().await }
    })
    .await
}
