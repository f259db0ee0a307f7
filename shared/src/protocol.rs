//! Wire types carried over the relay tunnel.
//!
//! An HTTP request cannot cross the tunnel as a live stream, so the passthrough
//! side drains it into a [`SurrogateRequest`] and the handler side answers with a
//! [`SurrogateResponse`]. Both travel inside the two remote operations of
//! [`RemoteCall`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Fixed acknowledgment returned by a heartbeat ping.
pub const PING_ACK: &str = "pong";

/// Multi-valued string mapping used for headers and form values.
pub type ValueMap = BTreeMap<String, Vec<String>>;

/// Serializable stand-in for an inbound HTTP request with a pre-read body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurrogateRequest {
    pub method: String,
    /// Request target as received, path plus optional query.
    pub url: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    /// Header names are stored lowercase.
    pub headers: ValueMap,
    pub body: Vec<u8>,
    /// Declared content length, if the request carried one.
    pub content_length: Option<u64>,
    pub transfer_encoding: Vec<String>,
    pub host: String,
    pub form: ValueMap,
}

impl SurrogateRequest {
    /// Protocol string such as `HTTP/1.1`.
    pub fn proto(&self) -> String {
        format!("HTTP/{}.{}", self.proto_major, self.proto_minor)
    }

    /// Path component of the request target.
    pub fn path(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or("");
        if path.is_empty() {
            "/"
        } else {
            path
        }
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

/// Serializable stand-in for the response a relayed handler produced.
///
/// Writes replace the body instead of appending to it, and the status reads as
/// 200 until one is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurrogateResponse {
    status: Option<u16>,
    body: Vec<u8>,
}

impl SurrogateResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Some(status),
            body: body.into(),
        }
    }

    /// Replace the body, returning the number of bytes written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        self.body = bytes.to_vec();
        self.body.len()
    }

    pub fn write_header(&mut self, status: u16) {
        self.status = Some(status);
    }

    /// Effective status code.
    pub fn status(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    /// Status exactly as the handler set it.
    pub fn explicit_status(&self) -> Option<u16> {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// The remote operations a passthrough endpoint may invoke on a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteCall {
    /// Execute a request against the handler's private routes.
    Dispatch(SurrogateRequest),
    /// Heartbeat carrying the caller's clock.
    Ping { sent_at: DateTime<Utc> },
}

impl RemoteCall {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteCall::Dispatch(_) => "dispatch",
            RemoteCall::Ping { .. } => "ping",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteReply {
    Dispatched(SurrogateResponse),
    Pong(String),
    /// The call was received but could not be served.
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFrame {
    pub seq: u64,
    pub call: RemoteCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub seq: u64,
    pub reply: RemoteReply,
}
