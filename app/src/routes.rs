//! Public router and the per-mode placement of relayable routes.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request as AxumRequest, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use chatops_relay::{ingress_route, FormValues, Mode, RelayHandler, RouteParams, TunnelEndpoint};
use serde_json::json;
use tracing::{debug, info};

use crate::health::HealthReport;

#[derive(Clone)]
pub struct AppState {
    pub endpoint: Arc<TunnelEndpoint>,
    pub started: Instant,
}

/// Decides where a relayable route lives: served directly when the relay is
/// off, relayed from the passthrough, or executed from the handler's private
/// table.
pub struct RouteRegistrar {
    endpoint: Arc<TunnelEndpoint>,
    router: Router<AppState>,
    paths: Vec<String>,
}

impl RouteRegistrar {
    pub fn new(endpoint: Arc<TunnelEndpoint>, router: Router<AppState>) -> Self {
        Self {
            endpoint,
            router,
            paths: Vec::new(),
        }
    }

    pub async fn relayable<H: RelayHandler>(mut self, path: &str, handler: H) -> anyhow::Result<Self> {
        match self.endpoint.mode() {
            Mode::Off => {
                let handler: Arc<dyn RelayHandler> = Arc::new(handler);
                self.router = self.router.route(
                    &axum_path(path),
                    any(move |req: Request<Body>| {
                        let handler = handler.clone();
                        async move { handler.call(req).await }
                    }),
                );
            }
            Mode::PassThrough => {
                self.router = self
                    .router
                    .route(&axum_path(path), ingress_route(self.endpoint.clone()));
            }
            Mode::Handler => {
                self.endpoint.register_handler(path, handler).await?;
            }
        }
        debug!(path, mode = %self.endpoint.mode(), "registered relayable route");
        self.paths.push(path.to_string());
        Ok(self)
    }

    pub fn finish(self) -> Router<AppState> {
        for path in &self.paths {
            info!("active relayable route: {}", path);
        }
        self.router
    }
}

/// `{name}` segments become axum 0.7 `:name` captures.
fn axum_path(path: &str) -> String {
    path.split('/')
        .map(|seg| match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) if !name.is_empty() => format!(":{}", name),
            _ => seg.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Build the full public router.
pub async fn build_router(state: AppState) -> anyhow::Result<Router> {
    let public = Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/chatops/info", get(info_handler));

    let router = RouteRegistrar::new(state.endpoint.clone(), public)
        .relayable("/chatops/echo", echo_handler)
        .await?
        .finish();

    Ok(router
        .layer(middleware::from_fn(log_request))
        .with_state(state))
}

async fn log_request(req: AxumRequest, next: Next) -> Response {
    info!("{} {} {:?}", req.method(), req.uri(), req.version());
    next.run(req).await
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthReport::collect(&state.endpoint, state.started).await)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.endpoint.to_prometheus().await,
    )
}

async fn info_handler(State(state): State<AppState>) -> impl IntoResponse {
    format!(
        "{} {} (relay mode: {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        state.endpoint.mode()
    )
}

/// Diagnostic route that reports what it received, wherever it ran.
async fn echo_handler(req: Request<Body>) -> Response {
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let form = req.extensions().get::<FormValues>().map(|f| f.0.clone());
    let params = req.extensions().get::<RouteParams>().map(|p| p.0.clone());

    match axum::body::to_bytes(req.into_body(), 64 * 1024).await {
        Ok(body) => Json(json!({
            "method": method,
            "uri": uri,
            "form": form,
            "params": params,
            "body": String::from_utf8_lossy(&body),
        }))
        .into_response(),
        Err(_) => (StatusCode::PAYLOAD_TOO_LARGE, "body too large").into_response(),
    }
}
