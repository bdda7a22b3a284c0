//! One long-lived connection to one DC.
//!
//! Each connection is a tokio task owning a [`Session`] and the stream under
//! it. Callers talk to it through a cloneable [`ConnectionHandle`]: a call
//! becomes a command on an unbounded channel and its answer comes back on a
//! oneshot. The task reconnects on its own when the stream breaks, paced by
//! a [`FloodControl`], and the session keeps pending requests across
//! reconnects.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mtlink_crypto::{AuthKey, CryptoProvider};
use mtlink_mtproto::{
    CodecEvent, FloodControl, PacketCodec, RequestId, Salt, Session, SessionConfig, SessionError, SessionEvent,
    TransportError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DcOption;
use crate::errors::{InvocationError, RpcError};
use crate::pipeline::CallResult;
use crate::storage::SessionStorage;
use crate::transport::{Stream, Transport, TransportKind};

const READ_BUFFER: usize = 64 * 1024;
const FLOOD_BACKOFF_MIN: u64 = 1_000;
const FLOOD_BACKOFF_MAX: u64 = 16_000;

// ─── Clock ────────────────────────────────────────────────────────────────────

/// Unix milliseconds derived from tokio's clock, so that paused-time tests
/// move session timers along with everything else.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Clock {
    base_ms: u64,
    start: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self { base_ms: mtlink_mtproto::unix_now_ms().max(0) as u64, start: Instant::now() }
    }

    pub(crate) fn now(&self) -> u64 { self.base_ms + self.start.elapsed().as_millis() as u64 }

    /// The tokio instant of a unix-millisecond deadline.
    pub(crate) fn instant_at(&self, ms: u64) -> Instant {
        self.start + Duration::from_millis(ms.saturating_sub(self.base_ms))
    }
}

// ─── Environment ──────────────────────────────────────────────────────────────

/// What every connection of a client shares.
pub(crate) struct ConnectionEnv {
    pub transport: Arc<dyn Transport>,
    pub transport_kind: TransportKind,
    pub crypto: Arc<dyn CryptoProvider>,
    pub storage: Arc<dyn SessionStorage>,
    pub session_config: SessionConfig,
    pub clock: Clock,
}

// ─── Handle ───────────────────────────────────────────────────────────────────

enum Command {
    Call { ticket: u64, body: Vec<u8>, chain: Option<String>, reply: oneshot::Sender<CallResult> },
    Cancel(u64),
}

/// Sends calls to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    dc_id: i32,
    tx: mpsc::UnboundedSender<Command>,
    tickets: Arc<AtomicU64>,
    stop: CancellationToken,
}

/// Tells the connection to forget a call unless it completed.
struct CancelOnDrop<'a> {
    tx: &'a mpsc::UnboundedSender<Command>,
    ticket: u64,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.tx.send(Command::Cancel(self.ticket));
        }
    }
}

impl ConnectionHandle {
    pub fn dc_id(&self) -> i32 { self.dc_id }

    /// Whether the connection task has exited.
    pub fn is_closed(&self) -> bool { self.tx.is_closed() }

    /// Shut the connection down. Calls still waiting fail with
    /// [`InvocationError::Dropped`].
    pub fn stop(&self) { self.stop.cancel(); }

    /// Send a serialized request and wait for its answer. Requests sharing a
    /// `chain` are processed in the order they were sent.
    pub async fn invoke(
        &self,
        body: Vec<u8>,
        chain: Option<&str>,
        timeout: Option<Duration>,
        abort: Option<&CancellationToken>,
    ) -> CallResult {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let chain = chain.map(str::to_owned);
        self.tx.send(Command::Call { ticket, body, chain, reply }).map_err(|_| InvocationError::Dropped)?;
        let mut guard = CancelOnDrop { tx: &self.tx, ticket, armed: true };

        let expired = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        let aborted = async {
            match abort {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            res = rx => {
                guard.armed = false;
                res.unwrap_or(Err(InvocationError::Dropped))
            }
            _ = expired => Err(InvocationError::Timeout),
            _ = aborted => Err(InvocationError::Cancelled),
        }
    }
}

/// Start a connection task for `dc`.
///
/// `updates` receives raw `Updates` pushes; pass it only for the connection
/// the account's updates should come from.
pub(crate) fn spawn(
    env: Arc<ConnectionEnv>,
    dc: DcOption,
    auth_key: AuthKey,
    updates: Option<mpsc::UnboundedSender<Vec<u8>>>,
    shutdown: &CancellationToken,
) -> ConnectionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let stop = shutdown.child_token();

    let mut config = env.session_config.clone();
    config.receive_updates = updates.is_some();
    let session = Session::new(env.crypto.clone(), auth_key, config);

    let mut reconnects = FloodControl::new();
    reconnects.add_limit(1_000, 1);
    reconnects.add_limit(4_000, 2);
    reconnects.add_limit(8_000, 3);

    let handle = ConnectionHandle { dc_id: dc.id, tx, tickets: Arc::new(AtomicU64::new(1)), stop: stop.clone() };
    let codec = env.transport_kind.codec(&dc, env.crypto.clone());
    let actor = Actor {
        env,
        dc,
        session,
        codec,
        rx,
        updates,
        stop,
        waiting: HashMap::new(),
        tickets: HashMap::new(),
        reconnects,
        flood_backoff: 0,
        saved_salts: Vec::new(),
    };
    tokio::spawn(actor.run());
    handle
}

// ─── Actor ────────────────────────────────────────────────────────────────────

struct Waiter {
    ticket: u64,
    reply: oneshot::Sender<CallResult>,
}

enum Exit {
    /// Reconnect and carry on.
    Reconnect,
    /// Stop for good; the handle was stopped or dropped.
    Shutdown,
    /// Stop for good and fail everything with this error.
    Fatal(InvocationError),
}

struct Actor {
    env: Arc<ConnectionEnv>,
    dc: DcOption,
    session: Session,
    codec: Box<dyn PacketCodec>,
    rx: mpsc::UnboundedReceiver<Command>,
    updates: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stop: CancellationToken,
    waiting: HashMap<RequestId, Waiter>,
    tickets: HashMap<u64, RequestId>,
    reconnects: FloodControl,
    flood_backoff: u64,
    saved_salts: Vec<Salt>,
}

impl Actor {
    async fn run(mut self) {
        self.restore_salts();
        let err = loop {
            let Some(stream) = self.connect().await else { break InvocationError::Dropped };
            let exit = self.drive(stream).await;
            self.session.on_disconnect();
            match exit {
                Exit::Reconnect => continue,
                Exit::Shutdown => break InvocationError::Dropped,
                Exit::Fatal(e) => break e,
            }
        };
        tracing::debug!("[mtlink] DC{} connection stopped: {err}", self.dc.id);
        self.fail_all(|| match &err {
            InvocationError::Security(s) => InvocationError::Security(s.clone()),
            _ => InvocationError::Dropped,
        });
    }

    /// Open a stream, honouring the reconnect limits. Commands keep being
    /// accepted meanwhile. `None` once the connection should stop.
    async fn connect(&mut self) -> Option<Box<dyn Stream>> {
        loop {
            let clock = self.env.clock;
            if !self.reconnects.is_allowed(clock.now()) {
                let at = clock.instant_at(self.reconnects.wakeup_at());
                tokio::select! {
                    _ = self.stop.cancelled() => return None,
                    cmd = self.rx.recv() => {
                        self.on_command(cmd?);
                        continue;
                    }
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            self.reconnects.add_event(clock.now());

            let env = self.env.clone();
            let dc = self.dc.clone();
            let connecting = env.transport.connect(&dc);
            tokio::pin!(connecting);
            loop {
                tokio::select! {
                    _ = self.stop.cancelled() => return None,
                    cmd = self.rx.recv() => self.on_command(cmd?),
                    res = &mut connecting => match res {
                        Ok(stream) => return Some(stream),
                        Err(e) => {
                            tracing::warn!("[mtlink] DC{} connect failed: {e}", self.dc.id);
                            break;
                        }
                    },
                }
            }
        }
    }

    async fn drive(&mut self, mut stream: Box<dyn Stream>) -> Exit {
        let clock = self.env.clock;
        self.codec = self.env.transport_kind.codec(&self.dc, self.env.crypto.clone());
        let tag = self.codec.tag();
        if let Err(e) = stream.write_all(&tag).await {
            tracing::warn!("[mtlink] DC{} failed to send transport tag: {e}", self.dc.id);
            return Exit::Reconnect;
        }
        tracing::debug!("[mtlink] DC{} connected", self.dc.id);
        self.session.start(clock.now());

        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            if let Err(e) = self.flush(&mut stream).await {
                tracing::warn!("[mtlink] DC{} write failed: {e}", self.dc.id);
                return Exit::Reconnect;
            }
            self.persist_salts();

            let deadline = self.session.next_deadline().map(|ms| clock.instant_at(ms));
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.stop.cancelled() => return Exit::Shutdown,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => return Exit::Shutdown,
                },
                read = stream.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::info!("[mtlink] DC{} closed the connection", self.dc.id);
                        return Exit::Reconnect;
                    }
                    Ok(n) => {
                        if let Some(exit) = self.on_bytes(&buf[..n]) {
                            return exit;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("[mtlink] DC{} read failed: {e}", self.dc.id);
                        return Exit::Reconnect;
                    }
                },
                _ = timer => self.session.handle_timers(clock.now()),
            }
        }
    }

    async fn flush(&mut self, stream: &mut Box<dyn Stream>) -> io::Result<()> {
        let now = self.env.clock.now();
        let mut wrote = false;
        loop {
            let packet = match self.session.poll_transmit(now) {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(e) => return Err(io::Error::other(e)),
            };
            let framed = self.codec.encode(&packet).map_err(io::Error::other)?;
            stream.write_all(&framed).await?;
            wrote = true;
        }
        if wrote {
            stream.flush().await?;
        }
        Ok(())
    }

    fn enqueue(&mut self, body: Vec<u8>, chain: Option<&str>) -> Result<RequestId, SessionError> {
        match chain {
            Some(chain) => self.session.enqueue_chained_rpc(body, chain),
            None => self.session.enqueue_rpc(body),
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call { ticket, body, chain, reply } => match self.enqueue(body, chain.as_deref()) {
                Ok(id) => {
                    self.waiting.insert(id, Waiter { ticket, reply });
                    self.tickets.insert(ticket, id);
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },
            Command::Cancel(ticket) => {
                if let Some(id) = self.tickets.remove(&ticket) {
                    self.waiting.remove(&id);
                    self.session.cancel_rpc(id);
                }
            }
        }
    }

    fn on_bytes(&mut self, data: &[u8]) -> Option<Exit> {
        let events = match self.codec.feed(data) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!("[mtlink] DC{} sent a malformed packet: {e}", self.dc.id);
                return Some(Exit::Reconnect);
            }
        };
        for event in events {
            match event {
                CodecEvent::Packet(mut frame) => match self.session.handle_frame(&mut frame, self.env.clock.now()) {
                    Ok(events) => {
                        self.flood_backoff = 0;
                        for ev in events {
                            if let Some(exit) = self.on_session_event(ev) {
                                return Some(exit);
                            }
                        }
                    }
                    Err(e) if e.is_security_violation() => {
                        tracing::warn!("[mtlink] DC{} sent an untrustworthy frame ({e}), reconnecting", self.dc.id);
                        return Some(Exit::Reconnect);
                    }
                    Err(e) => tracing::warn!("[mtlink] DC{} frame dropped: {e}", self.dc.id),
                },
                CodecEvent::TransportError(TransportError(code)) => return Some(self.on_transport_error(code)),
            }
        }
        None
    }

    fn on_transport_error(&mut self, code: i32) -> Exit {
        match code {
            -404 => {
                tracing::error!("[mtlink] DC{} does not know our auth key, forgetting it", self.dc.id);
                if let Err(e) = self.env.storage.set_auth_key(self.dc.id, None) {
                    tracing::warn!("[mtlink] failed to forget auth key: {e}");
                }
                Exit::Fatal(InvocationError::Security(format!("auth key rejected by DC{}", self.dc.id)))
            }
            -429 => {
                self.flood_backoff = match self.flood_backoff {
                    0 => FLOOD_BACKOFF_MIN,
                    b => (b * 2).min(FLOOD_BACKOFF_MAX),
                };
                tracing::warn!("[mtlink] DC{} transport flood, pausing {}ms", self.dc.id, self.flood_backoff);
                self.session.on_transport_flood(self.env.clock.now(), self.flood_backoff);
                Exit::Reconnect
            }
            code => {
                tracing::warn!("[mtlink] DC{} transport error {code}, reconnecting", self.dc.id);
                Exit::Reconnect
            }
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) -> Option<Exit> {
        match event {
            SessionEvent::RpcResult { id, body } => self.complete(id, Ok(body)),
            SessionEvent::RpcError { id, error } => {
                let err = RpcError::from_telegram(error.error_code, &error.error_message);
                self.complete(id, Err(err.into()));
            }
            SessionEvent::RpcFailed { id, reason } => self.complete(id, Err(InvocationError::Deserialize(reason))),
            SessionEvent::Update(body) => {
                if let Some(tx) = &self.updates {
                    let _ = tx.send(body);
                }
            }
            SessionEvent::Pong { rtt } => tracing::trace!("[mtlink] DC{} pong, rtt {rtt}ms", self.dc.id),
            SessionEvent::Reset => {
                tracing::info!("[mtlink] DC{} session was reset", self.dc.id);
                return Some(Exit::Reconnect);
            }
        }
        None
    }

    fn complete(&mut self, id: RequestId, result: CallResult) {
        if let Some(w) = self.waiting.remove(&id) {
            self.tickets.remove(&w.ticket);
            let _ = w.reply.send(result);
        }
    }

    fn fail_all(&mut self, err: impl Fn() -> InvocationError) {
        for (_, w) in self.waiting.drain() {
            let _ = w.reply.send(Err(err()));
        }
        self.tickets.clear();
        self.session.drain_rpcs();
        while let Ok(cmd) = self.rx.try_recv() {
            if let Command::Call { reply, .. } = cmd {
                let _ = reply.send(Err(err()));
            }
        }
        self.rx.close();
    }

    fn restore_salts(&mut self) {
        match self.env.storage.future_salts(self.dc.id) {
            Ok(Some(salts)) if !salts.is_empty() => {
                self.saved_salts = salts.clone();
                self.session.install_future_salts(salts, self.env.clock.now());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("[mtlink] failed to load salts for DC{}: {e}", self.dc.id),
        }
    }

    fn persist_salts(&mut self) {
        let salts: Vec<Salt> = self.session.salts().future_salts().copied().collect();
        if salts.is_empty() || salts == self.saved_salts {
            return;
        }
        if let Err(e) = self.env.storage.set_future_salts(self.dc.id, &salts) {
            tracing::warn!("[mtlink] failed to save salts for DC{}: {e}", self.dc.id);
        }
        self.saved_salts = salts;
    }
}
