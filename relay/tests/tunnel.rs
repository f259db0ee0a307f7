mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use chatops_relay::{Error, FormValues, Health, Mode, RouteParams, TunnelEndpoint};
use common::*;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

async fn body_of(resp: Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

async fn echo(req: Request<Body>) -> Response {
    let marker = req
        .headers()
        .get("x")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let body = axum::body::to_bytes(req.into_body(), 1024).await.unwrap_or_default();
    match marker.as_deref() {
        Some("Y") => (StatusCode::OK, body).into_response(),
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

#[tokio::test]
async fn test_round_trip() {
    init_tracing();
    let (pass, addr) = passthrough(".+").await;
    let handler = handler(addr);
    handler.register_handler("/echo", echo).await.unwrap();
    handler
        .register_handler("/silent", |_req: Request<Body>| async {})
        .await
        .unwrap();
    handler
        .register_handler("/teapot", |_req: Request<Body>| async {
            (StatusCode::IM_A_TEAPOT, "short and stout")
        })
        .await
        .unwrap();
    handler.connect().unwrap();
    assert!(wait_connected(&pass).await);

    let req = Request::builder()
        .method("POST")
        .uri("/echo")
        .header("X", "Y")
        .body(Body::from("abc123"))
        .unwrap();
    let resp = pass.relay_request(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_of(resp).await, b"abc123");

    let resp = pass
        .relay_request(Request::builder().uri("/silent").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_of(resp).await.is_empty());

    let resp = pass
        .relay_request(Request::builder().uri("/teapot").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(body_of(resp).await, b"short and stout");

    let resp = pass
        .relay_request(Request::builder().uri("/nowhere").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_of(resp).await, b"relay failure");

    // the tunnel survives a failed dispatch
    assert!(pass.is_connected().await);
    assert_eq!(pass.metrics().rpc_count(), 4);
    assert_eq!(handler.metrics().rpc_count(), 4);

    handler.close().await.unwrap();
    pass.close().await.unwrap();
}

#[tokio::test]
async fn test_route_params_and_form_values_cross_the_tunnel() {
    init_tracing();
    let (pass, addr) = passthrough(".+").await;
    let handler = handler(addr);
    handler
        .register_handler("/chatops/{action}", |req: Request<Body>| async move {
            let action = req
                .extensions()
                .get::<RouteParams>()
                .and_then(|p| p.get("action"))
                .unwrap_or_default()
                .to_string();
            let target = req
                .extensions()
                .get::<FormValues>()
                .and_then(|f| f.get("target"))
                .unwrap_or_default()
                .to_string();
            format!("{} {}", action, target)
        })
        .await
        .unwrap();
    handler.connect().unwrap();
    assert!(wait_connected(&pass).await);

    let req = Request::builder()
        .method("POST")
        .uri("/chatops/deploy")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from("target=api"))
        .unwrap();
    let resp = pass.relay_request(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_of(resp).await, b"deploy api");

    handler.close().await.unwrap();
    pass.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnects_after_handler_drops() {
    init_tracing();
    let (pass, addr) = passthrough(".+").await;

    let first = handler(addr);
    first.connect().unwrap();
    assert!(wait_connected(&pass).await);
    let status = pass.status().await;
    assert_eq!(status.health, Health::Green);
    assert!(status.rpc_latency.is_some());

    // the next heartbeat fails on the closed stream
    first.close().await.unwrap();
    let dropped = wait_until(INTERVAL * 3, || {
        let pass = pass.clone();
        async move { !pass.is_connected().await }
    })
    .await;
    assert!(dropped, "tunnel still marked connected after one heartbeat");
    assert_eq!(pass.status().await.health, Health::Red);
    assert!(pass.caller().await.is_none());

    let second = handler(addr);
    second
        .register_handler("/ping", |_req: Request<Body>| async { "ok" })
        .await
        .unwrap();
    second.connect().unwrap();
    assert!(wait_connected(&pass).await);

    let resp = pass
        .relay_request(Request::builder().uri("/ping").body(Body::empty()).unwrap())
        .await;
    assert_eq!(body_of(resp).await, b"ok");

    let status = pass.status().await;
    assert_eq!(status.connect_count, 2);
    assert_eq!(pass.disconnect_times().await.len(), 1);
    assert!(status.last_ping.is_some());

    second.close().await.unwrap();
    pass.close().await.unwrap();
}

#[tokio::test]
async fn test_passthrough_drops_unresponsive_peer() {
    init_tracing();
    let (pass, addr) = passthrough(".+").await;

    // handshakes, then never answers a call
    let held = raw_peer(addr).await;
    assert!(wait_connected(&pass).await);

    // one interval to the next heartbeat, two more for its reply deadline
    let dropped = wait_until(INTERVAL * 5, || {
        let pass = pass.clone();
        async move { !pass.is_connected().await }
    })
    .await;
    assert!(dropped);
    assert_eq!(pass.disconnect_times().await.len(), 1);

    drop(held);
    pass.close().await.unwrap();
}

#[tokio::test]
async fn test_passthrough_drops_vanished_peer() {
    init_tracing();
    let (pass, addr) = passthrough(".+").await;

    let peer = raw_peer(addr).await;
    assert!(wait_connected(&pass).await);

    // no close_notify, just a dropped socket
    drop(peer);
    let dropped = wait_until(INTERVAL * 3, || {
        let pass = pass.clone();
        async move { !pass.is_connected().await }
    })
    .await;
    assert!(dropped);
    assert!(pass.caller().await.is_none());

    pass.close().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_request_keeps_tunnel() {
    init_tracing();
    let (pass, addr) = passthrough(".+").await;
    let handler = handler(addr);
    handler
        .register_handler("/slow", |_req: Request<Body>| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            "slow"
        })
        .await
        .unwrap();
    handler
        .register_handler("/ok", |_req: Request<Body>| async { "ok" })
        .await
        .unwrap();
    handler.connect().unwrap();
    assert!(wait_connected(&pass).await);

    // the public client gives up long before the handler answers
    let slow = pass.relay_request(Request::builder().uri("/slow").body(Body::empty()).unwrap());
    assert!(tokio::time::timeout(Duration::from_millis(50), slow).await.is_err());
    tokio::time::sleep(Duration::from_millis(400)).await;

    let resp = pass
        .relay_request(Request::builder().uri("/ok").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_of(resp).await, b"ok");
    assert!(pass.is_connected().await);
    assert_eq!(pass.status().await.connect_count, 1);
    assert!(pass.disconnect_times().await.is_empty());

    handler.close().await.unwrap();
    pass.close().await.unwrap();
}

#[tokio::test]
async fn test_oversized_request_is_rejected_alone() {
    init_tracing();
    let (pass, addr) = passthrough(".+").await;
    let handler = handler(addr);
    handler
        .register_handler("/ok", |_req: Request<Body>| async { "ok" })
        .await
        .unwrap();
    handler.connect().unwrap();
    assert!(wait_connected(&pass).await);

    // under the body limit, but the parsed form doubles it past one frame
    let mut body = b"a=".to_vec();
    body.resize(9 * 1024 * 1024, b'x');
    let req = Request::builder()
        .method("POST")
        .uri("/ok")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();
    let resp = pass.relay_request(req).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_of(resp).await, b"request too large");

    let caller = pass.caller().await.unwrap();
    assert!(!caller.is_closed());
    let resp = pass
        .relay_request(Request::builder().uri("/ok").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(pass.status().await.connect_count, 1);

    handler.close().await.unwrap();
    pass.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_drops_silent_tunnel_and_redials() {
    init_tracing();
    // a TLS peer that accepts but never pings
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(self_signed());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(tls) = acceptor.accept(stream).await {
                held.push(tls);
            }
        }
    });

    let handler = handler(addr);
    handler.connect().unwrap();
    assert!(wait_connected(&handler).await);

    let redialed = wait_until(Duration::from_secs(5), || {
        let handler = handler.clone();
        async move { handler.connect_times().await.len() >= 2 }
    })
    .await;
    assert!(redialed);
    assert!(!handler.disconnect_times().await.is_empty());

    handler.close().await.unwrap();
}

#[tokio::test]
async fn test_whitelist_rejects_peer() {
    init_tracing();
    let (pass, addr) = passthrough(r"10\.0\.0\.\d+").await;
    let handler = handler(addr);
    handler.connect().unwrap();

    tokio::time::sleep(INTERVAL * 5).await;
    assert!(!pass.is_connected().await);
    assert_eq!(pass.status().await.connect_count, 0);
    assert!(!handler.is_connected().await);

    handler.close().await.unwrap();
    pass.close().await.unwrap();
}

#[tokio::test]
async fn test_close_listening_endpoint_once() {
    let (pass, _addr) = passthrough(".+").await;
    pass.close().await.unwrap();
    assert!(pass.is_closed());
    assert!(matches!(pass.close().await, Err(Error::AlreadyClosed)));
}

#[tokio::test]
async fn test_handler_close_stops_dialing() {
    // nothing listens on this port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let handler = handler(addr);
    let dialer = handler.connect().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handler.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), dialer)
        .await
        .expect("dialer should stop after close")
        .unwrap();
}

#[test]
fn test_conflicting_modes_fail_before_network() {
    assert!(matches!(Mode::from_flags(true, true), Err(Error::ConflictingModes)));
    let err = TunnelEndpoint::new("", 0, ".+", Mode::Handler, chatops_relay::TlsConfig::None);
    assert!(matches!(err, Err(Error::Tls(_))));
}
