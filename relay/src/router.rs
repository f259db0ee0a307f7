//! Private route table for relayed requests.
//!
//! Only the handler endpoint populates this table. Patterns are matched segment
//! by segment; a `{name}` segment captures one path segment into
//! [`RouteParams`]. Methods are not part of the match.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::RwLock;

/// A handler capability the relay can execute for a matched path.
///
/// Any `Fn(Request<Body>) -> impl Future<Output = impl IntoResponse>` qualifies,
/// which is also the shape axum accepts, so the same function can be mounted on
/// a public router when the relay is off.
pub trait RelayHandler: Send + Sync + 'static {
    fn call(&self, req: Request<Body>) -> BoxFuture<'static, Response>;
}

impl<F, Fut, R> RelayHandler for F
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse,
{
    fn call(&self, req: Request<Body>) -> BoxFuture<'static, Response> {
        let fut = (self)(req);
        async move { fut.await.into_response() }.boxed()
    }
}

/// Path segments captured by `{name}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams(pub HashMap<String, String>);

impl RouteParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    fn parse(path: &str) -> Self {
        let segments = path
            .split('/')
            .map(|seg| {
                match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
                    _ => Segment::Literal(seg.to_string()),
                }
            })
            .collect();
        Self {
            raw: path.to_string(),
            segments,
        }
    }

    fn matches(&self, path: &str) -> Option<RouteParams> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Param(name) if !part.is_empty() => {
                    params.insert(name.clone(), part.to_string());
                }
                _ => return None,
            }
        }
        Some(RouteParams(params))
    }
}

struct Route {
    pattern: RoutePattern,
    handler: Arc<dyn RelayHandler>,
}

/// Router mapping path patterns to relay handlers
pub struct RouteTable {
    routes: RwLock<Vec<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler. Registering the same pattern twice replaces the
    /// earlier handler.
    pub async fn add_route(&self, path: &str, handler: Arc<dyn RelayHandler>) {
        let pattern = RoutePattern::parse(path);
        let mut routes = self.routes.write().await;
        match routes.iter_mut().find(|r| r.pattern == pattern) {
            Some(existing) => existing.handler = handler,
            None => routes.push(Route { pattern, handler }),
        }
    }

    /// First registered route matching `path`.
    pub async fn resolve(&self, path: &str) -> Option<(Arc<dyn RelayHandler>, RouteParams)> {
        let routes = self.routes.read().await;
        routes.iter().find_map(|route| {
            route
                .pattern
                .matches(path)
                .map(|params| (route.handler.clone(), params))
        })
    }

    pub async fn paths(&self) -> Vec<String> {
        let routes = self.routes.read().await;
        routes.iter().map(|r| r.pattern.raw.clone()).collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn named(name: &'static str) -> &'static str {
        name
    }

    fn handler(name: &'static str) -> Arc<dyn RelayHandler> {
        Arc::new(move |_req: Request<Body>| named(name))
    }

    #[test]
    fn test_pattern_matching() {
        let root = RoutePattern::parse("/");
        assert!(root.matches("/").is_some());
        assert!(root.matches("/events").is_none());

        let exact = RoutePattern::parse("/slack/events");
        assert!(exact.matches("/slack/events").is_some());
        assert!(exact.matches("/slack/events/").is_none());
        assert!(exact.matches("/slack").is_none());

        let vars = RoutePattern::parse("/chatops/{action}");
        let params = vars.matches("/chatops/reload").unwrap();
        assert_eq!(params.get("action"), Some("reload"));
        assert!(vars.matches("/chatops/").is_none());
    }

    #[tokio::test]
    async fn test_resolve_and_replace() {
        let table = RouteTable::new();
        assert!(table.is_empty().await);
        table.add_route("/slack/events", handler("events")).await;
        table.add_route("/slack/{kind}", handler("generic")).await;
        table.add_route("/slack/events", handler("events-v2")).await;

        assert_eq!(table.paths().await, vec!["/slack/events", "/slack/{kind}"]);

        let (h, params) = table.resolve("/slack/events").await.unwrap();
        assert!(params.0.is_empty());
        let resp = h.call(Request::new(Body::empty())).await;
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"events-v2");

        let (_, params) = table.resolve("/slack/commands").await.unwrap();
        assert_eq!(params.get("kind"), Some("commands"));

        assert!(table.resolve("/unknown").await.is_none());
    }
}
