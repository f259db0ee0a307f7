//! ChatOps tunnel relay
//!
//! Lets a public front node forward HTTP requests to a private worker over a
//! single TLS connection that the worker dials out to establish.

pub mod backoff;
pub mod endpoint;
pub mod ingress;
mod liveness;
pub mod metrics;
pub mod router;
pub mod rpc;
pub mod service;
pub mod shutdown;
pub mod status;
pub mod surrogate;
pub mod tls;
pub mod whitelist;

pub use chatops_shared::{Error, Result};
pub use endpoint::{Mode, TunnelEndpoint};
pub use ingress::ingress_route;
pub use metrics::RelayMetrics;
pub use router::{RelayHandler, RouteParams};
pub use status::{Health, RelayStatus};
pub use surrogate::FormValues;
pub use tls::TlsConfig;
pub use whitelist::{Whitelist, DEFAULT_WHITELIST};
