//! Health document and the periodic status updater.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chatops_relay::shutdown::ShutdownListener;
use chatops_relay::{Health, Mode, RelayStatus, TunnelEndpoint};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub component: &'static str,
    pub version: &'static str,
    pub health: Health,
    pub mode: Mode,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
    /// Absent when the relay is off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayStatus>,
}

impl HealthReport {
    pub async fn collect(endpoint: &TunnelEndpoint, started: Instant) -> Self {
        let mode = endpoint.mode();
        let relay = match mode {
            Mode::Off => None,
            _ => Some(endpoint.status().await),
        };
        let health = relay.as_ref().map(|s| s.health).unwrap_or(Health::Green);

        Self {
            component: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            health,
            mode,
            uptime_secs: started.elapsed().as_secs(),
            timestamp: Utc::now(),
            relay,
        }
    }
}

/// Log the health document every `interval` until shutdown, noting changes.
pub async fn run_status_updater(
    endpoint: Arc<TunnelEndpoint>,
    started: Instant,
    interval: Duration,
    mut shutdown: ShutdownListener,
) {
    let mut last = Health::Green;
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let report = HealthReport::collect(&endpoint, started).await;
        if report.health != last {
            match report.health {
                Health::Green => info!("health is green again"),
                Health::Red => warn!("health is red: relay tunnel is down"),
            }
            last = report.health;
        }
        match serde_json::to_string(&report) {
            Ok(json) => debug!("status: {}", json),
            Err(e) => warn!("cannot encode status: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatops_relay::TlsConfig;

    #[tokio::test]
    async fn test_off_mode_report_has_no_relay_section() {
        let endpoint = TunnelEndpoint::new("", 0, ".+", Mode::Off, TlsConfig::None).unwrap();
        let report = HealthReport::collect(&endpoint, Instant::now()).await;
        assert_eq!(report.health, Health::Green);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["component"], "chatops");
        assert!(json.get("relay").is_none());
    }

    #[tokio::test]
    async fn test_handler_report_is_red_until_connected() {
        let endpoint = TunnelEndpoint::new(
            "",
            5000,
            ".+",
            Mode::Handler,
            TlsConfig::Client(chatops_relay::tls::client_config(None, true).unwrap()),
        )
        .unwrap();
        let report = HealthReport::collect(&endpoint, Instant::now()).await;
        assert_eq!(report.health, Health::Red);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["relay"]["mode"], "handler");
        assert_eq!(json["relay"]["isConnected"], false);
    }

    #[tokio::test]
    async fn test_updater_stops_on_shutdown() {
        let endpoint = Arc::new(TunnelEndpoint::new("", 0, ".+", Mode::Off, TlsConfig::None).unwrap());
        let signal = chatops_relay::shutdown::ShutdownSignal::new();
        let task = tokio::spawn(run_status_updater(
            endpoint,
            Instant::now(),
            Duration::from_millis(10),
            signal.subscribe(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
