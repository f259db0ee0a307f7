//! The relay service exposed to the passthrough side.
//!
//! Holds the private route table and answers the two remote operations. It also
//! keeps the heartbeat bookkeeping the handler's liveness watcher reads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatops_shared::protocol::{RemoteCall, RemoteReply, SurrogateRequest, SurrogateResponse, PING_ACK};
use chatops_shared::{Error, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::router::{RelayHandler, RouteTable};
use crate::surrogate;

pub struct RelayService {
    routes: RouteTable,
    /// Caller-supplied timestamp of the latest heartbeat.
    last_ping: Mutex<Option<DateTime<Utc>>>,
    /// Local arrival time of the latest heartbeat.
    last_seen: Mutex<Instant>,
    in_flight: AtomicUsize,
    relay_hook: Box<dyn Fn() + Send + Sync>,
}

impl RelayService {
    /// `relay_hook` runs once per dispatched request, before routing.
    pub fn new(relay_hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            routes: RouteTable::new(),
            last_ping: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            relay_hook: Box::new(relay_hook),
        }
    }

    pub(crate) async fn handle_func(&self, path: &str, handler: Arc<dyn RelayHandler>) {
        self.routes.add_route(path, handler).await;
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Answer one remote call.
    pub async fn serve_call(&self, call: RemoteCall) -> RemoteReply {
        match call {
            RemoteCall::Dispatch(req) => match self.dispatch(req).await {
                Ok(resp) => RemoteReply::Dispatched(resp),
                Err(e) => {
                    warn!("relayed request failed: {}", e);
                    RemoteReply::Failed(e.to_string())
                }
            },
            RemoteCall::Ping { sent_at } => RemoteReply::Pong(self.ping(sent_at).await),
        }
    }

    /// Execute a relayed request against the private routes as if it had
    /// arrived over plain HTTP.
    pub async fn dispatch(&self, req: SurrogateRequest) -> Result<SurrogateResponse> {
        (self.relay_hook)();

        let path = req.path().to_string();
        let (handler, params) = self
            .routes
            .resolve(&path)
            .await
            .ok_or_else(|| Error::NoRoute(path.clone()))?;
        debug!("dispatching relayed {} {}", req.method, path);

        let mut request = surrogate::into_request(req)?;
        request.extensions_mut().insert(params);

        let _busy = InFlight::enter(&self.in_flight);
        let resp = surrogate::from_response(handler.call(request).await).await;
        *self.last_seen.lock().await = Instant::now();
        Ok(resp)
    }

    /// Record a heartbeat and acknowledge it.
    pub async fn ping(&self, sent_at: DateTime<Utc>) -> String {
        self.stamp_ping(sent_at).await;
        *self.last_seen.lock().await = Instant::now();
        PING_ACK.to_string()
    }

    pub async fn last_ping(&self) -> Option<DateTime<Utc>> {
        *self.last_ping.lock().await
    }

    pub(crate) async fn stamp_ping(&self, at: DateTime<Utc>) {
        *self.last_ping.lock().await = Some(at);
    }

    /// Start a fresh liveness window, used when a connection is established.
    pub(crate) async fn reset_liveness(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    /// True when no heartbeat arrived within `window` and no relayed request is
    /// executing.
    pub(crate) async fn ping_overdue(&self, window: Duration) -> bool {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return false;
        }
        self.last_seen.lock().await.elapsed() > window
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
