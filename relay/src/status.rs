//! Status snapshot for external health reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::endpoint::{Mode, TunnelEndpoint};
use crate::metrics::LatencySummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Green,
    Red,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub health: Health,
    pub mode: Mode,
    pub last_ping: Option<DateTime<Utc>>,
    #[serde(rename = "isConnected")]
    pub connected: bool,
    pub connect_time: Option<DateTime<Utc>>,
    pub connect_count: u64,
    pub rpc_count: u64,
    /// Call rate and latencies are only tracked where calls originate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_rate_per_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_latency: Option<LatencySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_latency: Option<LatencySummary>,
}

impl TunnelEndpoint {
    pub async fn status(&self) -> RelayStatus {
        let (connected, connect_time, connect_count) = {
            let state = self.state.lock().await;
            (state.connected, state.connect_time, state.connect_count)
        };
        let mode = self.mode();
        let health = if connected || mode == Mode::Off {
            Health::Green
        } else {
            Health::Red
        };

        let passthrough = mode == Mode::PassThrough;
        let (rpc_rate_per_min, rpc_latency, ping_latency) = if passthrough {
            (
                Some(self.metrics.rpc_rate_per_min()),
                Some(self.metrics.rpc_latency().await),
                Some(self.metrics.ping_latency().await),
            )
        } else {
            (None, None, None)
        };

        RelayStatus {
            health,
            mode,
            last_ping: self.service.last_ping().await,
            connected,
            connect_time,
            connect_count,
            rpc_count: self.metrics.rpc_count(),
            rpc_rate_per_min,
            rpc_latency,
            ping_latency,
        }
    }

    /// Prometheus text for this endpoint.
    pub async fn to_prometheus(&self) -> String {
        let connected = self.is_connected().await;
        self.metrics.to_prometheus(self.mode().as_str(), connected).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TlsConfig;

    #[tokio::test]
    async fn test_status_json_shape() {
        let endpoint = TunnelEndpoint::new("", 0, ".+", Mode::Off, TlsConfig::None).unwrap();
        let status = endpoint.status().await;
        assert_eq!(status.health, Health::Green);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["mode"], "off");
        assert_eq!(json["isConnected"], false);
        assert_eq!(json["connectCount"], 0);
        assert!(json["lastPing"].is_null());
        assert!(json.get("rpcLatency").is_none());
    }

    #[tokio::test]
    async fn test_connection_history_in_status() {
        let endpoint = TunnelEndpoint::new("", 0, ".+", Mode::Off, TlsConfig::None).unwrap();
        let generation = endpoint.connected(None).await;
        endpoint.disconnected(generation).await;

        let status = endpoint.status().await;
        assert!(!status.connected);
        assert_eq!(status.connect_count, 1);
        assert!(status.connect_time.is_some());

        let text = endpoint.to_prometheus().await;
        assert!(text.contains("chatops_relay_connected{mode=\"off\"} 0"));
        assert!(text.contains("chatops_relay_connects_total{mode=\"off\"} 1"));
    }
}
