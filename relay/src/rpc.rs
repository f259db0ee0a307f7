//! Call/reply transport over the tunnel connection.
//!
//! The passthrough side holds an [`RpcCaller`] and the handler side runs an
//! [`RpcServer`]. Calls are strictly sequential: the connection stays locked
//! from writing a call until its reply has been read. Each exchange runs in
//! its own task, so a caller that stops waiting never leaves an unread reply
//! on the stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatops_shared::codec::{encode_frame, read_frame, write_encoded, write_frame};
use chatops_shared::protocol::{
    CallFrame, RemoteCall, RemoteReply, ReplyFrame, SurrogateRequest, SurrogateResponse,
};
use chatops_shared::{Error, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::service::RelayService;
use crate::shutdown::ShutdownSignal;

/// Upper bound on flushing the stream shut in [`RpcCaller::close`].
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Any byte stream the tunnel can run over, in practice a TLS stream.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedIo = Box<dyn TunnelIo>;

struct CallerState {
    seq: AtomicU64,
    broken: AtomicBool,
    closing: ShutdownSignal,
}

impl CallerState {
    fn is_closed(&self) -> bool {
        self.broken.load(Ordering::SeqCst) || self.closing.is_triggered()
    }
}

/// Calling half of the tunnel, owned by the passthrough connection task.
pub struct RpcCaller {
    peer: String,
    io: Arc<Mutex<BoxedIo>>,
    state: Arc<CallerState>,
}

impl RpcCaller {
    pub fn new(io: BoxedIo, peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            io: Arc::new(Mutex::new(io)),
            state: Arc::new(CallerState {
                seq: AtomicU64::new(0),
                broken: AtomicBool::new(false),
                closing: ShutdownSignal::new(),
            }),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether a transport failure or close has retired this handle.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Issue one call and wait for its reply.
    pub async fn call(&self, call: RemoteCall) -> Result<RemoteReply> {
        self.call_within(call, None).await
    }

    /// Issue one call, giving the peer at most `reply_within` to answer once
    /// the call is on the wire.
    ///
    /// A call that cannot be encoded fails alone. Any transport failure, late
    /// reply or mismatched reply retires the handle, so later calls fail fast
    /// instead of reusing a desynchronized stream. Dropping the returned future
    /// does not abandon the exchange: its reply is still read off the stream.
    pub async fn call_within(
        &self,
        call: RemoteCall,
        reply_within: Option<Duration>,
    ) -> Result<RemoteReply> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let task = tokio::spawn(run_call(
            self.io.clone(),
            self.state.clone(),
            self.peer.clone(),
            call,
            reply_within,
        ));
        match task.await {
            Ok(result) => result,
            Err(e) => {
                self.state.broken.store(true, Ordering::SeqCst);
                Err(Error::Connection(format!("rpc task failed: {}", e)))
            }
        }
    }

    pub async fn dispatch(&self, req: SurrogateRequest) -> Result<SurrogateResponse> {
        match self.call(RemoteCall::Dispatch(req)).await? {
            RemoteReply::Dispatched(resp) => Ok(resp),
            RemoteReply::Failed(msg) => Err(Error::Remote(msg)),
            RemoteReply::Pong(_) => Err(Error::Protocol("pong in reply to dispatch".into())),
        }
    }

    /// Heartbeat. A reply that takes longer than `reply_within` counts as a
    /// dead tunnel.
    pub async fn ping(&self, sent_at: DateTime<Utc>, reply_within: Duration) -> Result<String> {
        match self
            .call_within(RemoteCall::Ping { sent_at }, Some(reply_within))
            .await?
        {
            RemoteReply::Pong(ack) => Ok(ack),
            RemoteReply::Failed(msg) => Err(Error::Remote(msg)),
            RemoteReply::Dispatched(_) => {
                Err(Error::Protocol("dispatch result in reply to ping".into()))
            }
        }
    }

    /// Retire the handle, abandon any call in flight and shut the stream down.
    pub async fn close(&self) {
        self.state.closing.trigger();
        let io = self.io.clone();
        let shut = async move {
            let mut io = io.lock_owned().await;
            io.shutdown().await
        };
        match timeout(CLOSE_TIMEOUT, shut).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %self.peer, "tunnel shutdown: {}", e),
            Err(_) => warn!(peer = %self.peer, "tunnel shutdown timed out"),
        }
    }
}

async fn run_call(
    io: Arc<Mutex<BoxedIo>>,
    state: Arc<CallerState>,
    peer: String,
    call: RemoteCall,
    reply_within: Option<Duration>,
) -> Result<RemoteReply> {
    let mut closing = state.closing.subscribe();
    let mut guard = tokio::select! {
        _ = closing.wait() => return Err(Error::Closed),
        guard = io.lock_owned() => guard,
    };
    if state.is_closed() {
        return Err(Error::Closed);
    }

    let seq = state.seq.fetch_add(1, Ordering::Relaxed) + 1;
    let name = call.name();
    let frame = encode_frame(&CallFrame { seq, call })?;
    debug!(seq, call = name, %peer, "rpc call");

    let result = tokio::select! {
        _ = closing.wait() => Err(Error::Closed),
        result = exchange(&mut guard, seq, &frame, reply_within) => result,
    };
    if result.is_err() {
        state.broken.store(true, Ordering::SeqCst);
    }
    result
}

async fn exchange(
    io: &mut BoxedIo,
    seq: u64,
    frame: &[u8],
    reply_within: Option<Duration>,
) -> Result<RemoteReply> {
    write_encoded(io, frame).await?;
    let reply = match reply_within {
        Some(limit) => timeout(limit, read_frame::<_, ReplyFrame>(io))
            .await
            .map_err(|_| Error::Connection(format!("no reply to call {} within {:?}", seq, limit)))??,
        None => read_frame::<_, ReplyFrame>(io).await?,
    };
    match reply {
        None => Err(Error::Connection("tunnel closed by peer".into())),
        Some(frame) if frame.seq != seq => Err(Error::Protocol(format!(
            "reply for call {} while waiting for {}",
            frame.seq, seq
        ))),
        Some(frame) => Ok(frame.reply),
    }
}

/// Serving half of the tunnel. Exists only on handler endpoints.
pub struct RpcServer {
    service: Arc<RelayService>,
}

impl RpcServer {
    pub fn new(service: Arc<RelayService>) -> Self {
        Self { service }
    }

    /// Answer calls on `io` until the peer hangs up.
    pub async fn serve_conn<S>(&self, mut io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame: CallFrame = match read_frame(&mut io).await? {
                Some(frame) => frame,
                None => return Ok(()),
            };
            debug!(seq = frame.seq, call = frame.call.name(), "rpc serve");
            let reply = self.service.serve_call(frame.call).await;
            write_frame(&mut io, &ReplyFrame { seq: frame.seq, reply }).await?;
        }
    }
}
