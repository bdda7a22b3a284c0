//! Retry policies for `FLOOD_WAIT` and server-side failures.
//!
//! Two middlewares live here:
//!
//! * [`FloodWaiter`] sleeps through flood waits up to a threshold, and
//!   remembers per method how long the server asked to wait so that later
//!   calls do not knock on the door too early.
//! * [`Retry`] re-runs a call as long as its [`RetryPolicy`] says so.
//!   [`InternalErrors`] is the stock policy for `5xx` and `-503` answers.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::Mutex;
use std::time::Duration;

use mtlink_mtproto::LruCache;
use tokio::time::Instant;

use crate::errors::{FLOOD_WAIT_NAMES, InvocationError, RpcError};
use crate::pipeline::{BoxFuture, CallOptions, CallResult, Middleware, Next, RpcCall};

/// Sleep for `delay` unless the call is aborted first.
pub(crate) async fn sleep_or_abort(delay: Duration, options: &CallOptions) -> Result<(), InvocationError> {
    match &options.abort {
        Some(token) => tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = token.cancelled() => Err(InvocationError::Cancelled),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

// ─── RetryPolicy ──────────────────────────────────────────────────────────────

/// Controls how a [`Retry`] middleware reacts when a call fails.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext<'_>) -> ControlFlow<(), Duration>;

    /// Turn the last error into the one the caller sees.
    fn give_up(&self, error: InvocationError) -> InvocationError { error }
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
pub struct RetryContext<'a> {
    pub fail_count: NonZeroU32,
    pub slept_so_far: Duration,
    pub error: &'a InvocationError,
    pub options: &'a CallOptions,
}

/// Never retry.
pub struct NoRetries;

impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext<'_>) -> ControlFlow<(), Duration> { ControlFlow::Break(()) }
}

/// Retry answers the server failed to produce on its side: codes `>= 500`
/// and the `-503` timeout pseudo error.
///
/// A `-503` that survives every attempt (or any `-503` with
/// [`CallOptions::throw_503`]) is reported as [`InvocationError::Timeout`].
pub struct InternalErrors {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for InternalErrors {
    fn default() -> Self { Self { max_retries: 5, delay: Duration::from_secs(1) } }
}

impl RetryPolicy for InternalErrors {
    fn should_retry(&self, ctx: &RetryContext<'_>) -> ControlFlow<(), Duration> {
        let Some(err) = ctx.error.rpc() else { return ControlFlow::Break(()) };
        if !err.is_internal() {
            return ControlFlow::Break(());
        }
        if err.code == -503 && ctx.options.throw_503 {
            return ControlFlow::Break(());
        }
        let max = ctx.options.max_retry_count.unwrap_or(self.max_retries);
        if ctx.fail_count.get() > max {
            return ControlFlow::Break(());
        }

        let mut delay = self.delay;
        if err.is("WORKER_BUSY_TOO_LONG_RETRY") {
            delay = delay.max(Duration::from_secs(1));
        }
        tracing::warn!(
            "[mtlink] internal server error {} {}, retrying in {:?} (attempt {})",
            err.code,
            err.message(),
            delay,
            ctx.fail_count
        );
        ControlFlow::Continue(delay)
    }

    fn give_up(&self, error: InvocationError) -> InvocationError {
        match error {
            InvocationError::Rpc(e) if e.code == -503 => InvocationError::Timeout,
            e => e,
        }
    }
}

/// Middleware driving a [`RetryPolicy`].
pub struct Retry<P>(pub P);

impl<P: RetryPolicy> Middleware for Retry<P> {
    fn handle<'a>(&'a self, call: RpcCall, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            let mut fail_count = NonZeroU32::MIN;
            let mut slept_so_far = Duration::default();
            loop {
                let error = match next.run(call.clone()).await {
                    Ok(body) => return Ok(body),
                    Err(e) => e,
                };
                let ctx = RetryContext { fail_count, slept_so_far, error: &error, options: &call.options };
                match self.0.should_retry(&ctx) {
                    ControlFlow::Continue(delay) => {
                        sleep_or_abort(delay, &call.options).await?;
                        slept_so_far += delay;
                        fail_count = fail_count.saturating_add(1);
                    }
                    ControlFlow::Break(()) => return Err(self.0.give_up(error)),
                }
            }
        })
    }
}

// ─── FloodWaiter ──────────────────────────────────────────────────────────────

/// Below this many seconds, flood waits on polling methods are not worth a
/// warning.
const QUIET_WAIT_SECS: u64 = 5;

/// `updates.getDifference`, `updates.getChannelDifference`, `upload.getFile`,
/// `upload.saveFilePart`, `upload.saveBigFilePart`.
const QUIET_METHODS: &[u32] = &[0x19c2f763, 0x03173d78, 0xbe5335be, 0xb304a621, 0xde7b673d];

/// Sleeps through flood waits.
pub struct FloodWaiter {
    /// Longest wait slept through when the call does not say otherwise.
    pub max_wait: Duration,
    pub max_retries: u32,
    /// Remember waits per method.
    pub store: bool,
    /// Remembered waits shorter than this are forgotten instead of honoured.
    pub min_stored_wait: Duration,
    waits: Mutex<LruCache<u32, Instant>>,
}

impl Default for FloodWaiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), 5)
    }
}

impl FloodWaiter {
    pub fn new(max_wait: Duration, max_retries: u32) -> Self {
        Self {
            max_wait,
            max_retries,
            store: true,
            min_stored_wait: Duration::from_secs(2),
            waits: Mutex::new(LruCache::new(256)),
        }
    }

    fn waits(&self) -> std::sync::MutexGuard<'_, LruCache<u32, Instant>> {
        self.waits.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn remembered(&self, method: u32) -> Option<Instant> {
        if !self.store {
            return None;
        }
        self.waits().get(&method).copied()
    }

    fn forget(&self, method: u32) {
        self.waits().remove(&method);
    }

    fn remember(&self, method: u32, until: Instant) {
        self.waits().put(method, until);
    }
}

impl Middleware for FloodWaiter {
    fn handle<'a>(&'a self, call: RpcCall, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            let method = call.method_id().unwrap_or(0);
            let threshold = call.options.flood_sleep_threshold.unwrap_or(self.max_wait);

            if let Some(until) = self.remembered(method) {
                let delta = until.saturating_duration_since(Instant::now());
                if delta <= self.min_stored_wait {
                    self.forget(method);
                } else if delta <= threshold {
                    tracing::debug!("[mtlink] method {method:#010x} is flood-waited, sleeping {delta:?} first");
                    sleep_or_abort(delta, &call.options).await?;
                    self.forget(method);
                } else {
                    let secs = delta.as_millis().div_ceil(1000) as u32;
                    return Err(RpcError { code: 420, name: "FLOOD_WAIT".into(), value: Some(secs) }.into());
                }
            }

            let max_retries = call.options.max_retry_count.unwrap_or(self.max_retries);
            let mut last = None;
            for _ in 0..=max_retries {
                let error = match next.run(call.clone()).await {
                    Ok(body) => return Ok(body),
                    Err(e) => e,
                };
                let Some(err) = error.rpc().filter(|e| FLOOD_WAIT_NAMES.contains(&e.name.as_str())) else {
                    return Err(error);
                };
                let Some(mut secs) = err.value.map(u64::from) else {
                    tracing::warn!("[mtlink] flood wait without a duration ({}), not retrying", err.message());
                    return Err(error);
                };

                if self.store && err.name != "SLOWMODE_WAIT" {
                    self.remember(method, Instant::now() + Duration::from_secs(secs));
                }
                if secs == 0 {
                    secs = 1;
                }
                let wait = Duration::from_secs(secs);
                if wait > threshold {
                    return Err(error);
                }
                if !(secs < QUIET_WAIT_SECS && QUIET_METHODS.contains(&method)) {
                    tracing::warn!("[mtlink] method {method:#010x} hit a flood wait, retrying in {secs}s");
                }
                sleep_or_abort(wait, &call.options).await?;
                last = Some(error);
            }
            Err(last.unwrap_or(InvocationError::Dropped))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, RpcSender};
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers from a script, then repeats the last answer forever.
    struct Scripted {
        answers: Mutex<VecDeque<CallResult>>,
        last: Mutex<Option<(i32, String)>>,
        attempts: AtomicU32,
    }

    impl Scripted {
        fn new(answers: Vec<CallResult>) -> Arc<Self> {
            Arc::new(Self { answers: Mutex::new(answers.into()), last: Mutex::new(None), attempts: AtomicU32::new(0) })
        }

        fn always(code: i32, msg: &str) -> Arc<Self> {
            let s = Self::new(vec![]);
            *s.last.lock().unwrap() = Some((code, msg.to_string()));
            s
        }

        fn attempts(&self) -> u32 { self.attempts.load(Ordering::SeqCst) }
    }

    impl RpcSender for Scripted {
        fn send(&self, _: RpcCall) -> BoxFuture<'_, CallResult> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = self.answers.lock().unwrap().pop_front();
            let res = match next {
                Some(r) => r,
                None => match self.last.lock().unwrap().clone() {
                    Some((code, msg)) => Err(RpcError::from_telegram(code, &msg).into()),
                    None => Ok(vec![1]),
                },
            };
            Box::pin(async move { res })
        }
    }

    fn rpc(code: i32, msg: &str) -> CallResult { Err(RpcError::from_telegram(code, msg).into()) }

    fn call() -> RpcCall { RpcCall::new(0x11223344u32.to_le_bytes().to_vec(), CallOptions::default()) }

    fn retry_pipeline(sender: Arc<Scripted>) -> Pipeline {
        Pipeline::new(vec![Arc::new(Retry(InternalErrors::default()))], sender)
    }

    #[tokio::test(start_paused = true)]
    async fn internal_errors_make_max_retries_plus_one_attempts() {
        let sender = Scripted::always(500, "INTERNAL");
        let p = retry_pipeline(sender.clone());
        let err = p.call(call()).await.unwrap_err();
        assert_eq!(sender.attempts(), 6);
        assert!(err.is("INTERNAL"));

        let sender = Scripted::always(500, "INTERNAL");
        let p = retry_pipeline(sender.clone());
        let mut c = call();
        c.options.max_retry_count = Some(2);
        p.call(c).await.unwrap_err();
        assert_eq!(sender.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_503_is_a_timeout() {
        let sender = Scripted::always(-503, "Timeout");
        let p = retry_pipeline(sender.clone());
        assert!(matches!(p.call(call()).await, Err(InvocationError::Timeout)));
        assert_eq!(sender.attempts(), 6);

        let sender = Scripted::always(-503, "Timeout");
        let p = retry_pipeline(sender.clone());
        let mut c = call();
        c.options.throw_503 = true;
        assert!(matches!(p.call(c).await, Err(InvocationError::Timeout)));
        assert_eq!(sender.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let sender = Scripted::always(400, "PEER_ID_INVALID");
        let p = retry_pipeline(sender.clone());
        assert!(p.call(call()).await.unwrap_err().is("PEER_ID_INVALID"));
        assert_eq!(sender.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let sender = Scripted::new(vec![rpc(500, "INTERNAL"), Ok(vec![9])]);
        let p = retry_pipeline(sender.clone());
        let started = Instant::now();
        assert_eq!(p.call(call()).await.unwrap(), vec![9]);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_is_slept_through() {
        let sender = Scripted::new(vec![rpc(420, "FLOOD_WAIT_3"), Ok(vec![5])]);
        let p = Pipeline::new(vec![Arc::new(FloodWaiter::default())], sender.clone());
        let started = Instant::now();
        assert_eq!(p.call(call()).await.unwrap(), vec![5]);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(sender.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_threshold_returns_the_wait() {
        let sender = Scripted::new(vec![rpc(420, "FLOOD_WAIT_3")]);
        let p = Pipeline::new(vec![Arc::new(FloodWaiter::default())], sender.clone());
        let mut c = call();
        c.options.flood_sleep_threshold = Some(Duration::ZERO);
        let err = p.call(c).await.unwrap_err();
        assert_eq!(err.flood_wait_seconds(), Some(3));
        assert_eq!(sender.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_waits_are_remembered() {
        let sender = Scripted::new(vec![rpc(420, "FLOOD_WAIT_60")]);
        let waiter = Arc::new(FloodWaiter::default());
        let p = Pipeline::new(vec![waiter], sender.clone());

        assert_eq!(p.call(call()).await.unwrap_err().flood_wait_seconds(), Some(60));
        tokio::time::advance(Duration::from_secs(10)).await;

        let err = p.call(call()).await.unwrap_err();
        assert_eq!(err.flood_wait_seconds(), Some(50));
        assert_eq!(sender.attempts(), 1, "the second call never reached the network");
    }

    #[tokio::test(start_paused = true)]
    async fn slowmode_is_not_remembered() {
        let sender = Scripted::new(vec![rpc(420, "SLOWMODE_WAIT_60"), Ok(vec![1])]);
        let p = Pipeline::new(vec![Arc::new(FloodWaiter::default())], sender.clone());
        p.call(call()).await.unwrap_err();
        assert_eq!(p.call(call()).await.unwrap(), vec![1]);
        assert_eq!(sender.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_second_wait_sleeps_one_second() {
        let sender = Scripted::new(vec![rpc(420, "FLOOD_WAIT_0"), Ok(vec![1])]);
        let p = Pipeline::new(vec![Arc::new(FloodWaiter::default())], sender);
        let started = Instant::now();
        p.call(call()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let sender = Scripted::always(420, "FLOOD_WAIT_1");
        let p = Pipeline::new(vec![Arc::new(FloodWaiter::default())], sender.clone());
        assert_eq!(p.call(call()).await.unwrap_err().flood_wait_seconds(), Some(1));
        assert_eq!(sender.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_interrupts_the_sleep() {
        let sender = Scripted::new(vec![rpc(420, "FLOOD_WAIT_5")]);
        let p = Pipeline::new(vec![Arc::new(FloodWaiter::default())], sender);
        let token = tokio_util::sync::CancellationToken::new();
        let mut c = call();
        c.options.abort = Some(token.clone());
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            t.cancel();
        });
        assert!(matches!(p.call(c).await, Err(InvocationError::Cancelled)));
    }
}
