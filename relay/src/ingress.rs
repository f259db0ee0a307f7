//! Passthrough ingress: turns a public HTTP request into one relayed call.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, MethodRouter};
use chatops_shared::protocol::{SurrogateRequest, SurrogateResponse};
use chatops_shared::{Error, Result};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::endpoint::TunnelEndpoint;
use crate::surrogate::{self, MAX_BODY_SIZE};

impl TunnelEndpoint {
    /// Relay `req` across the tunnel and copy back the handler's status and
    /// body. Never waits for a tunnel to appear.
    pub async fn relay_request(&self, req: Request<Body>) -> Response {
        let method = req.method().clone();
        let uri = req.uri().clone();

        let surrogate = match surrogate::from_request(req, MAX_BODY_SIZE).await {
            Ok(surrogate) => surrogate,
            Err(e) => {
                warn!(%method, %uri, "cannot read request body: {}", e);
                return (StatusCode::BAD_REQUEST, "invalid body").into_response();
            }
        };

        match self.forward(surrogate).await {
            Ok(resp) => surrogate::into_response(resp),
            Err(Error::FrameTooLarge(size)) => {
                warn!(%method, %uri, size, "request does not fit in one tunnel frame");
                (StatusCode::PAYLOAD_TOO_LARGE, "request too large").into_response()
            }
            Err(Error::RelayUnavailable) => {
                warn!(%method, %uri, "no tunnel to relay over");
                (StatusCode::INTERNAL_SERVER_ERROR, "relay unavailable").into_response()
            }
            Err(e) => {
                error!(%method, %uri, "relay call failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "relay failure").into_response()
            }
        }
    }

    /// Issue one dispatch over the live tunnel.
    pub async fn forward(&self, req: SurrogateRequest) -> Result<SurrogateResponse> {
        let caller = self.caller().await.ok_or(Error::RelayUnavailable)?;

        self.metrics.count_rpc();
        let started = Instant::now();
        let result = caller.dispatch(req).await;
        let elapsed = started.elapsed();
        self.metrics.record_rpc_latency(elapsed).await;
        debug!(?elapsed, ok = result.is_ok(), "relayed call finished");
        result
    }
}

/// Route that relays every method through `endpoint`.
pub fn ingress_route<S>(endpoint: Arc<TunnelEndpoint>) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    any(move |req: Request<Body>| {
        let endpoint = endpoint.clone();
        async move { endpoint.relay_request(req).await }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Mode;
    use crate::tls::TlsConfig;

    #[tokio::test]
    async fn test_no_tunnel_fails_fast() {
        let endpoint = TunnelEndpoint::new("", 0, ".+", Mode::Off, TlsConfig::None).unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/slack/events")
            .body(Body::from("{}"))
            .unwrap();

        let resp = endpoint.relay_request(req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"relay unavailable");
        assert_eq!(endpoint.metrics().rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let endpoint = TunnelEndpoint::new("", 0, ".+", Mode::Off, TlsConfig::None).unwrap();
        let req = Request::builder()
            .uri("/upload")
            .body(Body::from(vec![b'x'; MAX_BODY_SIZE + 1]))
            .unwrap();

        let resp = endpoint.relay_request(req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"invalid body");
    }
}
