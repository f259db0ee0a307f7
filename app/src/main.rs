use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chatops_relay::{Mode, TunnelEndpoint};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod health;
mod routes;

use config::ChatOpsConfig;
use routes::AppState;

#[derive(Parser, Debug)]
#[command(name = "chatops")]
#[command(author = "ChatOps Team")]
#[command(version)]
#[command(about = "ChatOps bot with a TLS tunnel relay between a public front node and a private worker", long_about = None)]
struct Cli {
    /// YAML config file (defaults to chatops.yml in the working or home directory)
    #[arg(long, env = "CHATOPS_CONFIG")]
    config: Option<PathBuf>,

    /// Port for the status api and public routes
    #[arg(long, env = "CHATOPS_PORT")]
    port: Option<u16>,

    /// Target passthrough host (handler mode) or bind address (passthrough mode)
    #[arg(long, env = "CHATOPS_RELAY_HOST")]
    rhost: Option<String>,

    /// Relay communications port
    #[arg(long, env = "CHATOPS_RELAY_PORT")]
    rport: Option<u16>,

    /// Relay pass through mode
    #[arg(long, env = "CHATOPS_RELAY_PASSTHROUGH")]
    rp: bool,

    /// Relay handler mode
    #[arg(long, env = "CHATOPS_RELAY_HANDLER")]
    rh: bool,

    /// PEM certificate chain for the passthrough listener
    #[arg(long, env = "CHATOPS_RELAY_CERT_FILE")]
    cert: Option<PathBuf>,

    /// PEM private key for the passthrough listener
    #[arg(long, env = "CHATOPS_RELAY_KEY_FILE")]
    key: Option<PathBuf>,

    /// Extra CA certificate the handler trusts
    #[arg(long, env = "CHATOPS_RELAY_CA_FILE")]
    ca: Option<PathBuf>,

    /// TLS skip verify
    #[arg(long, env = "CHATOPS_RELAY_INSECURE")]
    insecure: bool,

    /// Regex over peer IPs allowed to connect to the relay (passthrough only)
    #[arg(long, env = "CHATOPS_RELAY_WHITELIST")]
    whitelist: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long, env = "CHATOPS_RELAY_CHECK_INTERVAL_MS")]
    check_interval_ms: Option<u64>,

    /// Verbose output
    #[arg(long, env = "CHATOPS_DEBUG")]
    debug: bool,
}

impl Cli {
    /// Flags win over the config file.
    fn apply(self, config: &mut ChatOpsConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.rhost {
            config.relay.host = host;
        }
        if let Some(port) = self.rport {
            config.relay.port = port;
        }
        config.relay.passthrough |= self.rp;
        config.relay.handler |= self.rh;
        if let Some(cert) = self.cert {
            config.relay.cert = cert;
        }
        if let Some(key) = self.key {
            config.relay.key = key;
        }
        if self.ca.is_some() {
            config.relay.ca = self.ca;
        }
        config.relay.insecure |= self.insecure;
        if let Some(whitelist) = self.whitelist {
            config.relay.whitelist = whitelist;
        }
        if let Some(ms) = self.check_interval_ms {
            config.relay.check_interval_ms = ms;
        }
        config.debug |= self.debug;
    }
}

fn load_config(cli: Cli) -> Result<ChatOpsConfig> {
    let path = cli.config.clone().or_else(ChatOpsConfig::find_config);
    let mut config = match &path {
        Some(path) => ChatOpsConfig::load(path)?,
        None => ChatOpsConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(Cli::parse())?;

    let filter = if config.debug {
        "chatops=debug,chatops_relay=debug"
    } else {
        "chatops=info,chatops_relay=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    if config.debug {
        if let Ok(json) = serde_json::to_string(&config) {
            info!("config: {}", json);
        }
    }

    let mode = config.mode()?;
    let endpoint = TunnelEndpoint::new(
        config.relay.host.clone(),
        config.relay.port,
        &config.relay.whitelist,
        mode,
        config.tls_config()?,
    )
    .with_context(|| format!("relay init failed, mode: {}", mode))?
    .with_check_interval(config.check_interval());
    let endpoint = Arc::new(endpoint);

    let started = Instant::now();
    let state = AppState {
        endpoint: endpoint.clone(),
        started,
    };
    let app = routes::build_router(state).await?;

    start_relay(&endpoint, &config).await?;

    tokio::spawn(health::run_status_updater(
        endpoint.clone(),
        started,
        health::STATUS_INTERVAL,
        endpoint.shutdown_listener(),
    ));
    tokio::spawn(wait_for_signal(endpoint.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status port {}", config.port))?;
    info!("starting http server: {}", addr);

    let mut shutdown = endpoint.shutdown_listener();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .context("http server failed")?;

    info!("http server shut down");
    Ok(())
}

async fn start_relay(endpoint: &Arc<TunnelEndpoint>, config: &ChatOpsConfig) -> Result<()> {
    info!("starting relay, mode: {}", endpoint.mode());
    if config.relay.insecure {
        warn!("relay insecure mode is ON");
    }
    let target = format!("{}:{}", config.relay.host, config.relay.port);
    match endpoint.mode() {
        Mode::PassThrough => {
            info!("listening for relay connection on {:?}", target);
            info!("passthrough whitelist: {:?}", config.relay.whitelist);
            endpoint.listen().await.context("relay listen failed")?;
        }
        Mode::Handler => {
            info!("connecting to relay {:?}", target);
            endpoint.connect().context("relay connect failed")?;
        }
        Mode::Off => {}
    }
    Ok(())
}

async fn wait_for_signal(endpoint: Arc<TunnelEndpoint>) {
    shutdown_signal().await;
    info!("shutting down");
    if let Err(e) = endpoint.close().await {
        error!("relay close failed: {}", e);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
