//! Heartbeat watchers.
//!
//! The passthrough side pings actively and gives up on the first failed
//! round trip, including a reply that does not arrive within two check
//! intervals. The handler side only listens: a tunnel that has gone two check
//! intervals without a ping is treated as dead.

use std::sync::Arc;

use chatops_shared::protocol::PING_ACK;
use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::endpoint::TunnelEndpoint;
use crate::rpc::RpcCaller;

/// Ping the handler every check interval. Returns once the tunnel is dead or
/// the endpoint shuts down.
pub(crate) async fn watch_caller(endpoint: &Arc<TunnelEndpoint>, caller: &RpcCaller) {
    let mut shutdown = endpoint.shutdown.subscribe();
    let interval = endpoint.check_interval();
    let reply_within = interval * 2;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = ticker.tick() => {}
        }

        let sent_at = Utc::now();
        let started = Instant::now();
        match caller.ping(sent_at, reply_within).await {
            Ok(ack) if ack == PING_ACK => {
                let rtt = started.elapsed();
                endpoint.metrics.record_ping_latency(rtt).await;
                endpoint.service.stamp_ping(sent_at).await;
                debug!(?rtt, peer = caller.peer(), "heartbeat");
            }
            Ok(ack) => {
                warn!(peer = caller.peer(), "unexpected heartbeat reply {:?}", ack);
                return;
            }
            Err(e) => {
                warn!(peer = caller.peer(), "heartbeat failed: {}", e);
                return;
            }
        }
    }
}

/// Wait until no ping has arrived for twice the check interval. Returns early
/// on shutdown.
pub(crate) async fn watch_pings(endpoint: &Arc<TunnelEndpoint>) {
    let mut shutdown = endpoint.shutdown.subscribe();
    let interval = endpoint.check_interval();
    let window = interval * 2;

    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if endpoint.service.ping_overdue(window).await {
            warn!("no heartbeat for {:?}, dropping tunnel", window);
            return;
        }
    }
}
