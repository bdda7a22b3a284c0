//! The middleware chain every outgoing call goes through.
//!
//! A [`Pipeline`] is an ordered list of [`Middleware`]s wrapped around an
//! [`RpcSender`], the primitive that actually puts a request on a
//! connection. Each middleware receives the call and a [`Next`] handle it can
//! run any number of times, which is how retries are expressed:
//!
//! ```text
//! user middlewares → flood waiter → internal-error retry → DC migration → sender (timeout, abort)
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::InvocationError;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The outcome of a call: the serialized answer or why there is none.
pub type CallResult = Result<Vec<u8>, InvocationError>;

// ─── CallOptions ──────────────────────────────────────────────────────────────

/// Per-call knobs.
#[derive(Clone, Debug)]
pub struct CallOptions {
    /// Give up on an answer after this long. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Send to this DC instead of the primary one.
    pub dc_id: Option<i32>,
    /// Longest flood wait slept through transparently. `Some(0)` never
    /// sleeps and returns the flood error instead; `None` uses the waiter's
    /// default.
    pub flood_sleep_threshold: Option<Duration>,
    /// Fires to abandon the call.
    pub abort: Option<CancellationToken>,
    /// Overrides how many times flood waits and internal errors are retried.
    pub max_retry_count: Option<u32>,
    /// Fail with [`InvocationError::Timeout`] on the first `-503` instead of
    /// retrying.
    pub throw_503: bool,
    /// Handle `*_MIGRATE_X` for this call only, without moving the client's
    /// primary DC.
    pub local_migrate: bool,
    /// Calls sharing a chain id are processed by the DC in the order they
    /// were sent. Unchained calls are multiplexed freely.
    pub chain_id: Option<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(10)),
            dc_id: None,
            flood_sleep_threshold: None,
            abort: None,
            max_retry_count: None,
            throw_503: false,
            local_migrate: false,
            chain_id: None,
        }
    }
}

// ─── RpcCall ──────────────────────────────────────────────────────────────────

/// A serialized request on its way through the pipeline.
#[derive(Clone, Debug)]
pub struct RpcCall {
    pub body: Vec<u8>,
    pub options: CallOptions,
}

impl RpcCall {
    pub fn new(body: Vec<u8>, options: CallOptions) -> Self { Self { body, options } }

    /// Constructor ID of the function being called.
    pub fn method_id(&self) -> Option<u32> {
        let b = self.body.get(..4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

// ─── Traits ───────────────────────────────────────────────────────────────────

/// The innermost stage: deliver one call to a connection and wait for its
/// answer, honouring `timeout` and `abort`.
pub trait RpcSender: Send + Sync {
    fn send(&self, call: RpcCall) -> BoxFuture<'_, CallResult>;
}

/// A stage of the pipeline.
pub trait Middleware: Send + Sync {
    fn handle<'a>(&'a self, call: RpcCall, next: Next<'a>) -> BoxFuture<'a, CallResult>;
}

/// The rest of the chain after the current middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    sender: &'a dyn RpcSender,
}

impl<'a> Next<'a> {
    pub fn run(self, call: RpcCall) -> BoxFuture<'a, CallResult> {
        match self.rest.split_first() {
            Some((head, rest)) => head.handle(call, Next { rest, sender: self.sender }),
            None => self.sender.send(call),
        }
    }
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

/// Middlewares composed around a sender, outermost first.
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    sender: Arc<dyn RpcSender>,
}

impl Pipeline {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>, sender: Arc<dyn RpcSender>) -> Self {
        Self { middlewares, sender }
    }

    pub async fn call(&self, call: RpcCall) -> CallResult {
        Next { rest: &self.middlewares[..], sender: self.sender.as_ref() }.run(call).await
    }
}
