//! ChatOps Shared Library
//!
//! Wire protocol, framing, and error types for the relay tunnel.

pub mod codec;
pub mod error;
pub mod protocol;

pub use error::{Error, Result};
