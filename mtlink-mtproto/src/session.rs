//! The sans-IO session engine.
//!
//! [`Session`] owns everything one encrypted MTProto session needs (pending
//! requests, acknowledgements, service queues, salts and timers) but never
//! touches a socket or a clock. The connection driving it feeds decrypted
//! frames in through [`Session::handle_frame`], fires timers through
//! [`Session::handle_timers`] and writes whatever [`Session::poll_transmit`]
//! hands back.
//!
//! Every timestamp is local unix time in milliseconds.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use mtlink_crypto::{AuthKey, CryptoProvider};
use mtlink_tl_types::mtproto::types::{self, GzipPacked};
use mtlink_tl_types::mtproto::{Boxed, ServiceMessage, functions, updates_ids};
use mtlink_tl_types::{Blob, Deserializable, Identifiable, RawVec, Serializable};

use crate::SessionError;
use crate::envelope::{gz_inflate, gzip_if_smaller};
use crate::lru::LruCache;
use crate::message::OutgoingMessage;
use crate::salt::{Salt, SaltTimer, ServerSaltManager};
use crate::scheduler::{Scheduler, TimerId};
use crate::state::SessionState;

/// Requests larger than this are refused before they reach the queue.
pub const MAX_PAYLOAD_SIZE: usize = 1_044_404;
/// Upper bound on the summed body size of one container.
pub const MAX_CONTAINER_SIZE: usize = 32768;
/// Upper bound on the number of messages in one container.
pub const MAX_CONTAINER_LEN: usize = 1020;
/// Upper bound on ids in a single `msgs_ack`, `msgs_state_req` or
/// `msg_resend_req`.
pub const MAX_IDS_PER_REQUEST: usize = 8192;

const RECENT_OUTGOING: usize = 1000;

/// Timing knobs of a [`Session`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// How often `ping_delay_disconnect` is sent.
    pub ping_interval: u64,
    /// `disconnect_delay` passed with every ping, in seconds.
    pub ping_disconnect_delay: i32,
    /// Longest time a lone acknowledgement waits for company.
    pub ack_flush_delay: u64,
    /// Queued acknowledgements that force an immediate flush.
    pub ack_flush_threshold: usize,
    /// How long after sending a request its state is asked for if the server
    /// has not acknowledged it.
    pub state_request_delay: u64,
    /// `num` passed to `get_future_salts`.
    pub future_salts_count: i32,
    /// Whether `Updates` pushes are surfaced. Only the main connection of a
    /// client receives them.
    pub receive_updates: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: 60_000,
            ping_disconnect_delay: 75,
            ack_flush_delay: 30_000,
            ack_flush_threshold: 100,
            state_request_delay: 1_500,
            future_salts_count: 64,
            receive_updates: true,
        }
    }
}

/// Handle for a request queued with [`Session::enqueue_rpc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn get(self) -> u64 { self.0 }
}

/// What the owner of the session has to act on after feeding it a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// The serialized result of a request.
    RpcResult { id: RequestId, body: Vec<u8> },
    /// The server answered the request with `rpc_error`.
    RpcError { id: RequestId, error: types::RpcError },
    /// The result arrived but could not be unpacked.
    RpcFailed { id: RequestId, reason: String },
    /// A boxed `Updates` object pushed by the server.
    Update(Vec<u8>),
    /// A ping was answered.
    Pong { rtt: u64 },
    /// The server rejected the session; all pending requests were requeued
    /// under a new session id and the transport should be reconnected.
    Reset,
}

#[derive(Debug)]
struct PendingRpc {
    body: Vec<u8>,
    /// Requests of one chain are processed by the server in send order.
    chain: Option<String>,
    msg_id: Option<i64>,
    container_id: Option<i64>,
    acked: bool,
    cancelled: bool,
    state_timer: Option<TimerId>,
}

/// What a sent msg_id stands for until the server answers or acknowledges it.
#[derive(Debug)]
enum Pending {
    Rpc(RequestId),
    Container(Vec<i64>),
    Ping { ping_id: i64, container_id: Option<i64> },
    StateReq { msg_ids: Vec<i64>, container_id: Option<i64> },
    ResendReq { msg_ids: Vec<i64>, container_id: Option<i64> },
    Cancel { req_msg_id: i64, container_id: Option<i64> },
    DestroySession { session_id: i64, container_id: Option<i64> },
    FutureSalts { container_id: Option<i64> },
}

impl Pending {
    fn set_container(&mut self, id: i64) {
        match self {
            Self::Rpc(_) | Self::Container(_) => {}
            Self::Ping { container_id, .. }
            | Self::StateReq { container_id, .. }
            | Self::ResendReq { container_id, .. }
            | Self::Cancel { container_id, .. }
            | Self::DestroySession { container_id, .. }
            | Self::FutureSalts { container_id } => *container_id = Some(id),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Rpc(_) => "rpc",
            Self::Container(_) => "container",
            Self::Ping { .. } => "ping",
            Self::StateReq { .. } => "state",
            Self::ResendReq { .. } => "resend",
            Self::Cancel { .. } => "cancel",
            Self::DestroySession { .. } => "destroy_session",
            Self::FutureSalts { .. } => "future_salts",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Timer {
    Flush,
    Ping,
    Salt,
    StateRequest(RequestId),
}

impl From<SaltTimer> for Timer {
    fn from(_: SaltTimer) -> Self { Timer::Salt }
}

#[derive(Clone, Copy, Debug)]
struct LastPing {
    msg_id: i64,
    sent_at: u64,
}

/// Bodies over 128 bytes are gzipped when that saves at least a tenth of
/// their size.
fn compress(body: Vec<u8>) -> Vec<u8> {
    match gzip_if_smaller(&body) {
        Some(packed) => {
            log::debug!("gzipped request ({}b -> {}b)", body.len(), packed.len());
            packed
        }
        None => body,
    }
}

/// One encrypted MTProto session.
pub struct Session {
    state: SessionState,
    config: SessionConfig,
    salts: ServerSaltManager,
    timers: Scheduler<Timer>,

    next_request: u64,
    rpcs: HashMap<RequestId, PendingRpc>,
    pending: HashMap<i64, Pending>,
    recent_outgoing: LruCache<i64, ()>,

    queued_rpc: VecDeque<RequestId>,
    /// Last msg_id sent for each chain.
    chains: HashMap<String, i64>,
    queued_acks: Vec<i64>,
    queued_state_req: Vec<i64>,
    queued_resend_req: Vec<i64>,
    queued_cancel: Vec<i64>,
    queued_destroy: Vec<i64>,

    flush_timer: Option<TimerId>,
    ping_timer: Option<TimerId>,
    flush_requested: bool,
    ping_due: bool,
    last_ping: Option<LastPing>,
    last_rtt: Option<u64>,
    last_session_uid: i64,
    paused_until: u64,
}

impl Session {
    pub fn new(crypto: Arc<dyn CryptoProvider>, auth_key: AuthKey, config: SessionConfig) -> Self {
        Self {
            state: SessionState::new(crypto, auth_key),
            config,
            salts: ServerSaltManager::new(),
            timers: Scheduler::new(),
            next_request: 0,
            rpcs: HashMap::new(),
            pending: HashMap::new(),
            recent_outgoing: LruCache::new(RECENT_OUTGOING),
            queued_rpc: VecDeque::new(),
            chains: HashMap::new(),
            queued_acks: Vec::new(),
            queued_state_req: Vec::new(),
            queued_resend_req: Vec::new(),
            queued_cancel: Vec::new(),
            queued_destroy: Vec::new(),
            flush_timer: None,
            ping_timer: None,
            flush_requested: false,
            ping_due: false,
            last_ping: None,
            last_rtt: None,
            last_session_uid: 0,
            paused_until: 0,
        }
    }

    pub fn session_id(&self) -> i64 { self.state.session_id() }

    pub fn auth_key(&self) -> &AuthKey { self.state.auth_key() }

    pub fn config(&self) -> &SessionConfig { &self.config }

    pub fn salts(&self) -> &ServerSaltManager { &self.salts }

    pub fn server_salt(&self) -> i64 { self.salts.current_salt() }

    pub fn set_server_salt(&mut self, salt: i64) { self.salts.set_current(salt); }

    /// Restore salts remembered from an earlier run.
    pub fn install_future_salts(&mut self, salts: Vec<Salt>, now: u64) {
        self.salts.set_future_salts(salts, now, &mut self.timers);
    }

    pub fn time_offset(&self) -> i32 { self.state.time_offset() }

    pub fn set_time_offset(&mut self, offset: i32) {
        self.state.set_time_offset(offset);
        self.salts.set_time_offset(offset);
    }

    pub fn last_rtt(&self) -> Option<u64> { self.last_rtt }

    /// Requests that have not been answered yet, cancelled ones excluded.
    pub fn pending_rpc_count(&self) -> usize {
        self.rpcs.values().filter(|r| !r.cancelled).count()
    }

    /// Called once the transport is connected: arms the ping timer and lets
    /// anything already queued go out.
    pub fn start(&mut self, now: u64) {
        if let Some(t) = self.ping_timer.take() {
            self.timers.cancel(t);
        }
        self.ping_timer = Some(self.timers.schedule(now + self.config.ping_interval, Timer::Ping));
        self.flush_requested = true;
    }

    /// Called when the transport goes away. Pending requests stay pending;
    /// the server replays answers on the next connection of this session.
    pub fn on_disconnect(&mut self) {
        if let Some(last) = self.last_ping.take() {
            self.pending.remove(&last.msg_id);
        }
        self.ping_due = false;
        self.flush_requested = false;
        for t in [self.flush_timer.take(), self.ping_timer.take()].into_iter().flatten() {
            self.timers.cancel(t);
        }
    }

    // ── Outgoing ──────────────────────────────────────────────────────────────

    /// Queue a serialized request. Bodies over 128 bytes are gzipped when
    /// that saves at least a tenth of their size.
    pub fn enqueue_rpc(&mut self, body: Vec<u8>) -> Result<RequestId, SessionError> {
        self.push_rpc(body, None)
    }

    /// Queue a request that the server must only process after the previous
    /// request of the same `chain` on this session. It is sent wrapped in
    /// `invokeAfterMsg` once an earlier request of the chain has gone out.
    pub fn enqueue_chained_rpc(&mut self, body: Vec<u8>, chain: &str) -> Result<RequestId, SessionError> {
        self.push_rpc(body, Some(chain.to_owned()))
    }

    fn push_rpc(&mut self, body: Vec<u8>, chain: Option<String>) -> Result<RequestId, SessionError> {
        if body.len() > MAX_PAYLOAD_SIZE {
            return Err(SessionError::PayloadTooLarge(body.len()));
        }
        // Chained bodies are compressed once wrapped, at send time.
        let body = if chain.is_some() { body } else { compress(body) };

        self.next_request += 1;
        let id = RequestId(self.next_request);
        self.rpcs.insert(
            id,
            PendingRpc {
                body,
                chain,
                msg_id: None,
                container_id: None,
                acked: false,
                cancelled: false,
                state_timer: None,
            },
        );
        self.queued_rpc.push_back(id);
        Ok(id)
    }

    /// Stop caring about a request. If it already went out the server is
    /// asked to drop the answer; otherwise it simply leaves the queue.
    ///
    /// Returns `false` if the request is unknown (already answered).
    pub fn cancel_rpc(&mut self, id: RequestId) -> bool {
        let Some(rpc) = self.rpcs.get_mut(&id) else { return false };
        if rpc.cancelled {
            return true;
        }
        match rpc.msg_id {
            Some(msg_id) => {
                rpc.cancelled = true;
                if let Some(t) = rpc.state_timer.take() {
                    self.timers.cancel(t);
                }
                self.queued_cancel.push(msg_id);
            }
            None => {
                self.rpcs.remove(&id);
                self.queued_rpc.retain(|q| *q != id);
            }
        }
        true
    }

    /// Drop every request, returning the ids that were still waiting.
    pub fn drain_rpcs(&mut self) -> Vec<RequestId> {
        for rpc in self.rpcs.values_mut() {
            if let Some(t) = rpc.state_timer.take() {
                self.timers.cancel(t);
            }
        }
        let mut ids: Vec<RequestId> =
            self.rpcs.drain().filter(|(_, r)| !r.cancelled).map(|(id, _)| id).collect();
        ids.sort();
        self.queued_rpc.clear();
        self.pending.clear();
        self.chains.clear();
        ids
    }

    fn queue_ack(&mut self, msg_id: i64, now: u64) {
        self.queued_acks.push(msg_id);
        if self.queued_acks.len() >= self.config.ack_flush_threshold {
            self.flush_requested = true;
        } else if self.flush_timer.is_none() {
            self.flush_timer = Some(self.timers.schedule(now + self.config.ack_flush_delay, Timer::Flush));
        }
    }

    fn has_work(&self) -> bool {
        !self.queued_rpc.is_empty()
            || self.ping_due
            || !self.queued_state_req.is_empty()
            || !self.queued_resend_req.is_empty()
            || !self.queued_cancel.is_empty()
            || !self.queued_destroy.is_empty()
            || self.salts.should_fetch_salts()
            || (!self.queued_acks.is_empty()
                && (self.flush_requested || self.queued_acks.len() >= self.config.ack_flush_threshold))
    }

    /// Build the next encrypted packet, if anything is due.
    ///
    /// Call repeatedly until it returns `None`: one packet carries at most
    /// [`MAX_CONTAINER_LEN`] messages.
    pub fn poll_transmit(&mut self, now: u64) -> Result<Option<Vec<u8>>, SessionError> {
        if now < self.paused_until || !self.has_work() {
            return Ok(None);
        }
        self.flush_requested = false;
        let now_ms = now as i64;

        let mut messages: Vec<OutgoingMessage> = Vec::new();
        let mut services: Vec<(i64, Pending)> = Vec::new();
        let mut sent_rpcs: Vec<RequestId> = Vec::new();

        if !self.queued_acks.is_empty() {
            let take = self.queued_acks.len().min(MAX_IDS_PER_REQUEST);
            let msg_ids: Vec<i64> = self.queued_acks.drain(..take).collect();
            let body = types::MsgsAck { msg_ids }.to_bytes();
            messages.push(self.state.wrap(body, false, now_ms));
            if self.queued_acks.is_empty() {
                if let Some(t) = self.flush_timer.take() {
                    self.timers.cancel(t);
                }
            }
        }

        if self.ping_due {
            self.ping_due = false;
            if let Some(last) = self.last_ping.take() {
                self.pending.remove(&last.msg_id);
            }
            let ping_id = self.state.crypto().random_u64() as i64;
            let body = functions::PingDelayDisconnect {
                ping_id,
                disconnect_delay: self.config.ping_disconnect_delay,
            }
            .to_bytes();
            let msg = self.state.wrap(body, true, now_ms);
            self.last_ping = Some(LastPing { msg_id: msg.msg_id, sent_at: now });
            services.push((msg.msg_id, Pending::Ping { ping_id, container_id: None }));
            messages.push(msg);
        }

        if !self.queued_state_req.is_empty() {
            let take = self.queued_state_req.len().min(MAX_IDS_PER_REQUEST);
            let msg_ids: Vec<i64> = self.queued_state_req.drain(..take).collect();
            let body = types::MsgsStateReq { msg_ids: msg_ids.clone() }.to_bytes();
            let msg = self.state.wrap(body, true, now_ms);
            services.push((msg.msg_id, Pending::StateReq { msg_ids, container_id: None }));
            messages.push(msg);
        }

        if !self.queued_resend_req.is_empty() {
            let take = self.queued_resend_req.len().min(MAX_IDS_PER_REQUEST);
            let msg_ids: Vec<i64> = self.queued_resend_req.drain(..take).collect();
            let body = types::MsgResendReq { msg_ids: msg_ids.clone() }.to_bytes();
            let msg = self.state.wrap(body, true, now_ms);
            services.push((msg.msg_id, Pending::ResendReq { msg_ids, container_id: None }));
            messages.push(msg);
        }

        for req_msg_id in std::mem::take(&mut self.queued_cancel) {
            let body = functions::RpcDropAnswer { req_msg_id }.to_bytes();
            let msg = self.state.wrap(body, true, now_ms);
            services.push((msg.msg_id, Pending::Cancel { req_msg_id, container_id: None }));
            messages.push(msg);
        }

        for session_id in std::mem::take(&mut self.queued_destroy) {
            let body = functions::DestroySession { session_id }.to_bytes();
            let msg = self.state.wrap(body, true, now_ms);
            services.push((msg.msg_id, Pending::DestroySession { session_id, container_id: None }));
            messages.push(msg);
        }

        if self.salts.should_fetch_salts() {
            self.salts.set_fetching(true);
            let body = functions::GetFutureSalts { num: self.config.future_salts_count }.to_bytes();
            let msg = self.state.wrap(body, true, now_ms);
            services.push((msg.msg_id, Pending::FutureSalts { container_id: None }));
            messages.push(msg);
        }

        let mut container_size: usize = messages.iter().map(|m| m.body.len() + 16).sum();
        while container_size < MAX_CONTAINER_SIZE && messages.len() < MAX_CONTAINER_LEN {
            let Some(id) = self.queued_rpc.pop_front() else { break };
            let Some(rpc) = self.rpcs.get_mut(&id) else { continue };
            if rpc.cancelled {
                continue;
            }
            // Every (re)send gets a fresh msg_id.
            let body = match &rpc.chain {
                Some(chain) => match self.chains.get(chain) {
                    Some(&after) => {
                        log::trace!("chain {chain:?}: invoking after {after}");
                        compress(functions::InvokeAfterMsg { msg_id: after, query: Blob(rpc.body.clone()) }.to_bytes())
                    }
                    None => compress(rpc.body.clone()),
                },
                None => rpc.body.clone(),
            };
            let msg = self.state.wrap(body, true, now_ms);
            rpc.msg_id = Some(msg.msg_id);
            if let Some(chain) = &rpc.chain {
                self.chains.insert(chain.clone(), msg.msg_id);
            }
            if let Some(t) = rpc.state_timer.take() {
                self.timers.cancel(t);
            }
            rpc.state_timer =
                Some(self.timers.schedule(now + self.config.state_request_delay, Timer::StateRequest(id)));
            container_size += msg.body.len() + 16;
            self.pending.insert(msg.msg_id, Pending::Rpc(id));
            sent_rpcs.push(id);
            messages.push(msg);
        }

        if messages.is_empty() {
            return Ok(None);
        }

        let root = if messages.len() == 1 {
            messages.remove(0)
        } else {
            let children: Vec<i64> = messages.iter().map(|m| m.msg_id).collect();
            let body = types::MsgContainer {
                messages: RawVec(
                    messages
                        .into_iter()
                        .map(|m| types::Message { msg_id: m.msg_id, seqno: m.seq_no, body: Blob(m.body) })
                        .collect(),
                ),
            }
            .to_bytes();
            let container = self.state.wrap(body, false, now_ms);
            for (_, p) in services.iter_mut() {
                p.set_container(container.msg_id);
            }
            for id in &sent_rpcs {
                if let Some(rpc) = self.rpcs.get_mut(id) {
                    rpc.container_id = Some(container.msg_id);
                }
            }
            log::trace!("packing {} messages into container {}", children.len(), container.msg_id);
            self.pending.insert(container.msg_id, Pending::Container(children));
            container
        };

        for (msg_id, p) in services {
            self.recent_outgoing.put(msg_id, ());
            self.pending.insert(msg_id, p);
        }
        for id in &sent_rpcs {
            if let Some(msg_id) = self.rpcs.get(id).and_then(|r| r.msg_id) {
                self.recent_outgoing.put(msg_id, ());
            }
        }

        log::trace!("sending msg_id {} (seq_no {}, {} bytes)", root.msg_id, root.seq_no, root.body.len());
        self.state.encrypt(&root, self.salts.current_salt()).map(Some)
    }

    /// Earliest instant [`Session::handle_timers`] or
    /// [`Session::poll_transmit`] has something to do.
    pub fn next_deadline(&mut self) -> Option<u64> {
        let timer = self.timers.next_deadline();
        if self.paused_until > 0 && self.has_work() {
            return Some(timer.map_or(self.paused_until, |t| t.min(self.paused_until)));
        }
        timer
    }

    /// Fire every timer that is due at `now`.
    pub fn handle_timers(&mut self, now: u64) {
        for (tid, timer) in self.timers.pop_due(now) {
            match timer {
                Timer::Flush => {
                    if self.flush_timer == Some(tid) {
                        self.flush_timer = None;
                    }
                    self.flush_requested = true;
                }
                Timer::Ping => {
                    self.ping_due = true;
                    self.ping_timer = Some(self.timers.schedule(now + self.config.ping_interval, Timer::Ping));
                }
                Timer::Salt => self.salts.on_timer(now, &mut self.timers),
                Timer::StateRequest(id) => {
                    let Some(rpc) = self.rpcs.get_mut(&id) else { continue };
                    rpc.state_timer = None;
                    if let (false, false, Some(msg_id)) = (rpc.acked, rpc.cancelled, rpc.msg_id) {
                        log::debug!("request {msg_id} not acknowledged yet, asking for its state");
                        self.queued_state_req.push(msg_id);
                    }
                }
            }
        }
        if now >= self.paused_until {
            self.paused_until = 0;
        }
    }

    /// Transport error `-429`: the server is flooded. Everything in flight is
    /// requeued and nothing is sent until `now + delay`.
    pub fn on_transport_flood(&mut self, now: u64, delay: u64) {
        let ids: Vec<i64> = self.pending.keys().copied().collect();
        for msg_id in ids {
            if matches!(self.pending.get(&msg_id), Some(Pending::Container(_))) {
                self.pending.remove(&msg_id);
            } else {
                self.on_failed(msg_id, true);
            }
        }
        self.paused_until = now + delay;
    }

    /// Throw away the current session: the server is told to destroy it and
    /// every pending request is requeued under a fresh session id.
    pub fn reset_session(&mut self) {
        self.queued_destroy.push(self.state.session_id());
        self.state.reset();
        self.last_session_uid = 0;
        if let Some(last) = self.last_ping.take() {
            self.pending.remove(&last.msg_id);
        }

        let mut requeue: Vec<RequestId> = Vec::new();
        for p in std::mem::take(&mut self.pending).into_values() {
            if let Pending::Rpc(id) = p {
                requeue.push(id);
            }
        }
        requeue.sort();
        for id in requeue.into_iter().rev() {
            match self.rpcs.get_mut(&id) {
                Some(rpc) if rpc.cancelled => {
                    self.rpcs.remove(&id);
                }
                Some(rpc) => {
                    rpc.msg_id = None;
                    rpc.container_id = None;
                    rpc.acked = false;
                    if let Some(t) = rpc.state_timer.take() {
                        self.timers.cancel(t);
                    }
                    self.queued_rpc.push_front(id);
                }
                None => {}
            }
        }
        // Ids of the old session mean nothing to the new one.
        self.chains.clear();
        self.queued_cancel.clear();
        self.queued_state_req.clear();
        self.queued_resend_req.clear();
        self.queued_acks.clear();
        self.salts.set_fetching(false);
    }

    // ── Incoming ──────────────────────────────────────────────────────────────

    /// Decrypt and process one frame from the transport.
    ///
    /// Errors are security failures: the caller must drop the connection.
    /// Frames for another session id are ignored.
    pub fn handle_frame(&mut self, frame: &mut [u8], now: u64) -> Result<Vec<SessionEvent>, SessionError> {
        let msg = match self.state.decrypt(frame) {
            Ok(msg) => msg,
            Err(SessionError::SessionMismatch { got }) => {
                log::warn!("ignoring message for session {got:#x} (ours is {:#x})", self.session_id());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let mut events = Vec::new();
        self.handle_raw(msg.msg_id, msg.seq_no, msg.body, now, &mut events);
        Ok(events)
    }

    fn handle_raw(&mut self, msg_id: i64, seq_no: i32, body: Vec<u8>, now: u64, events: &mut Vec<SessionEvent>) {
        let obj = match ServiceMessage::from_bytes(&body) {
            Ok(obj) => obj,
            Err(e) => {
                log::warn!("failed to parse message {msg_id}: {e}");
                return;
            }
        };
        match obj {
            ServiceMessage::GzipPacked(gz) => match gz_inflate(&gz.packed_data) {
                Ok(inner) => self.handle_raw(msg_id, seq_no, inner, now, events),
                Err(e) => log::warn!("failed to inflate message {msg_id}: {e}"),
            },
            ServiceMessage::MsgContainer(c) => {
                for m in c.messages.0 {
                    self.handle_raw(m.msg_id, m.seqno, m.body.0, now, events);
                }
            }
            other => self.handle_message(msg_id, seq_no, other, now, events),
        }
    }

    fn handle_message(
        &mut self,
        msg_id: i64,
        seq_no: i32,
        msg: ServiceMessage,
        now: u64,
        events: &mut Vec<SessionEvent>,
    ) {
        if !self.state.register_incoming(msg_id) {
            return;
        }
        log::trace!("received msg_id {msg_id} (seq_no {seq_no})");
        if msg.requires_ack() {
            self.queue_ack(msg_id, now);
        }

        match msg {
            ServiceMessage::RpcResult(r) => self.on_rpc_result(r, now, events),
            ServiceMessage::Pong(p) => self.on_pong(p.msg_id, p.ping_id, now, events),
            ServiceMessage::BadServerSalt(b) => {
                log::debug!("bad_server_salt for {}, new salt {:#x}", b.bad_msg_id, b.new_server_salt);
                self.salts.set_current(b.new_server_salt);
                self.on_failed(b.bad_msg_id, false);
            }
            ServiceMessage::BadMsgNotification(b) => self.on_bad_msg(msg_id, b, now, events),
            ServiceMessage::MsgsAck(a) => {
                for id in a.msg_ids {
                    self.on_acked(id, false);
                }
            }
            ServiceMessage::NewSessionCreated(n) => self.on_new_session(n, events),
            ServiceMessage::FutureSalts(f) => self.on_future_salts(f, now),
            ServiceMessage::MsgsStateInfo(s) => match self.pending.remove(&s.req_msg_id) {
                Some(Pending::StateReq { msg_ids, .. }) => self.on_messages_info(&msg_ids, &s.info),
                Some(other) => {
                    log::warn!("msgs_state_info for a {} query {}", other.kind(), s.req_msg_id);
                    self.pending.insert(s.req_msg_id, other);
                }
                None => log::warn!("msgs_state_info for unknown request {}", s.req_msg_id),
            },
            ServiceMessage::MsgsAllInfo(a) => self.on_messages_info(&a.msg_ids, &a.info),
            ServiceMessage::MsgDetailedInfo(d) => self.on_message_info(d.msg_id, d.status, d.answer_msg_id),
            ServiceMessage::MsgNewDetailedInfo(d) => self.on_message_info(0, d.status, d.answer_msg_id),
            ServiceMessage::MsgsStateReq(_) | ServiceMessage::MsgResendReq(_) => {
                log::warn!("server sent a state or resend request ({msg_id}), not answering");
            }
            ServiceMessage::DestroySession(res) => {
                use mtlink_tl_types::mtproto::enums::DestroySessionRes;
                let sid = match res {
                    DestroySessionRes::Ok(r) => r.session_id,
                    DestroySessionRes::None(r) => r.session_id,
                };
                log::debug!("session {sid:#x} destroyed");
                self.pending.retain(|_, p| !matches!(p, Pending::DestroySession { session_id, .. } if *session_id == sid));
            }
            ServiceMessage::RpcDropAnswer(r) => log::debug!("unsolicited rpc_drop_answer result: {r:?}"),
            ServiceMessage::GzipPacked(_) | ServiceMessage::MsgContainer(_) => {
                log::warn!("nested envelope in message {msg_id}, ignoring");
            }
            ServiceMessage::Other(blob) => match blob.constructor_id() {
                Some(id) if updates_ids::is_updates(id) => {
                    if self.config.receive_updates {
                        events.push(SessionEvent::Update(blob.0));
                    } else {
                        log::warn!("received updates on a connection that does not take them");
                    }
                }
                id => log::warn!("unknown message {msg_id} with constructor {id:08x?}"),
            },
        }
    }

    fn on_rpc_result(&mut self, r: types::RpcResult, now: u64, events: &mut Vec<SessionEvent>) {
        let req = r.req_msg_id;
        if req == 0 {
            log::warn!("rpc_result with req_msg_id = 0");
            return;
        }
        let Some(pending) = self.pending.remove(&req) else {
            if self.recent_outgoing.contains(&req) {
                log::debug!("rpc_result for {req} that is no longer pending");
            } else {
                log::warn!("rpc_result for unknown message {req}");
            }
            return;
        };

        match pending {
            Pending::Rpc(id) => self.finish_rpc(id, r.result, events),
            Pending::FutureSalts { .. } => match unpack_result(r.result)
                .and_then(|b| Ok(Boxed::<types::FutureSalts>::from_bytes(&b)?.0))
            {
                Ok(f) => self.on_future_salts(f, now),
                Err(e) => {
                    log::warn!("bad future_salts answer: {e}");
                    self.salts.set_fetching(false);
                }
            },
            Pending::Ping { .. } => {
                self.pending.insert(req, pending);
                match unpack_result(r.result).and_then(|b| Ok(Boxed::<types::Pong>::from_bytes(&b)?.0)) {
                    Ok(p) => self.on_pong(p.msg_id, p.ping_id, now, events),
                    Err(e) => log::warn!("bad pong answer: {e}"),
                }
            }
            Pending::Cancel { req_msg_id, .. } => log::debug!("request {req_msg_id} dropped by the server"),
            Pending::DestroySession { session_id, .. } => log::debug!("session {session_id:#x} destroyed"),
            other => log::error!("rpc_result for a {} message {req}", other.kind()),
        }
    }

    fn finish_rpc(&mut self, id: RequestId, result: Blob, events: &mut Vec<SessionEvent>) {
        let Some(mut rpc) = self.rpcs.remove(&id) else { return };
        if let Some(t) = rpc.state_timer.take() {
            self.timers.cancel(t);
        }
        if let Some(cid) = rpc.container_id {
            self.on_acked(cid, true);
        }
        if rpc.cancelled {
            log::debug!("dropping result of cancelled request {:?}", rpc.msg_id);
            return;
        }

        let body = match unpack_result(result) {
            Ok(body) => body,
            Err(e) => {
                events.push(SessionEvent::RpcFailed { id, reason: e.to_string() });
                return;
            }
        };
        if body.get(..4) == Some(&types::RpcError::CONSTRUCTOR_ID.to_le_bytes()[..]) {
            match Boxed::<types::RpcError>::from_bytes(&body) {
                Ok(Boxed(error)) => events.push(SessionEvent::RpcError { id, error }),
                Err(e) => events.push(SessionEvent::RpcFailed { id, reason: e.to_string() }),
            }
        } else {
            events.push(SessionEvent::RpcResult { id, body });
        }
    }

    fn on_pong(&mut self, msg_id: i64, ping_id: i64, now: u64, events: &mut Vec<SessionEvent>) {
        match self.pending.get(&msg_id) {
            Some(Pending::Ping { ping_id: expected, container_id }) => {
                if *expected != ping_id {
                    log::warn!("pong to {msg_id} with ping_id {ping_id}, expected {expected}");
                }
                let container_id = *container_id;
                self.pending.remove(&msg_id);
                if let Some(cid) = container_id {
                    self.on_acked(cid, true);
                }
            }
            Some(other) => {
                log::warn!("pong to a {} query {msg_id}", other.kind());
                return;
            }
            None => {
                log::warn!("pong to unknown ping {msg_id}");
                return;
            }
        }

        if let Some(last) = self.last_ping.take_if(|l| l.msg_id == msg_id) {
            let rtt = now.saturating_sub(last.sent_at);
            self.last_rtt = Some(rtt);
            log::debug!("pong: rtt = {rtt}ms");
            events.push(SessionEvent::Pong { rtt });
        }
    }

    fn on_bad_msg(
        &mut self,
        server_msg_id: i64,
        b: types::BadMsgNotification,
        now: u64,
        events: &mut Vec<SessionEvent>,
    ) {
        match b.error_code {
            16 | 17 | 20 => {
                if b.error_code != 20 {
                    self.state.sync_time(server_msg_id, now as i64);
                    self.salts.set_time_offset(self.state.time_offset());
                }
                log::debug!("bad_msg_notification {} for {}, resending", b.error_code, b.bad_msg_id);
                self.on_failed(b.bad_msg_id, false);
            }
            code => {
                log::error!("bad_msg_notification {code} for {}, resetting the session", b.bad_msg_id);
                self.reset_session();
                events.push(SessionEvent::Reset);
            }
        }
    }

    fn on_new_session(&mut self, n: types::NewSessionCreated, events: &mut Vec<SessionEvent>) {
        if n.unique_id == self.last_session_uid {
            log::debug!("repeated new_session_created (uid {}), ignoring", n.unique_id);
            return;
        }
        if self.last_session_uid != 0 && self.config.receive_updates {
            // The server forgot us: make the client fetch what it missed.
            events.push(SessionEvent::Update(updates_ids::UPDATES_TOO_LONG.to_le_bytes().to_vec()));
        }
        self.last_session_uid = n.unique_id;
        self.salts.set_current(n.server_salt);
        log::debug!("new_session_created, uid = {}, first msg_id = {}", n.unique_id, n.first_msg_id);

        let ids: Vec<i64> = self.pending.keys().copied().collect();
        for msg_id in ids {
            let container_id = match self.pending.get(&msg_id) {
                Some(Pending::Container(_)) => {
                    if msg_id < n.first_msg_id {
                        self.pending.remove(&msg_id);
                    }
                    continue;
                }
                Some(Pending::Rpc(id)) => self.rpcs.get(id).and_then(|r| r.container_id).unwrap_or(msg_id),
                Some(Pending::Ping { container_id, .. })
                | Some(Pending::StateReq { container_id, .. })
                | Some(Pending::ResendReq { container_id, .. })
                | Some(Pending::Cancel { container_id, .. })
                | Some(Pending::DestroySession { container_id, .. })
                | Some(Pending::FutureSalts { container_id }) => container_id.unwrap_or(msg_id),
                None => continue,
            };
            if container_id < n.first_msg_id {
                self.on_failed(msg_id, true);
            }
        }
    }

    fn on_future_salts(&mut self, f: types::FutureSalts, now: u64) {
        self.pending.remove(&f.req_msg_id);
        log::debug!("received {} future salts", f.salts.len());
        self.salts.set_future_salts(f.salts.iter().map(Salt::from), now, &mut self.timers);
    }

    fn on_messages_info(&mut self, msg_ids: &[i64], info: &[u8]) {
        if msg_ids.len() != info.len() {
            log::warn!("message state info has {} ids but {} states", msg_ids.len(), info.len());
        }
        for (&msg_id, &status) in msg_ids.iter().zip(info) {
            self.on_message_info(msg_id, status as i32, 0);
        }
    }

    fn on_message_info(&mut self, msg_id: i64, status: i32, answer_msg_id: i64) {
        if msg_id != 0 {
            if !self.pending.contains_key(&msg_id) {
                log::info!("message info about unknown message {msg_id}");
                return;
            }
            match status & 7 {
                1..=3 => {
                    log::debug!("message {msg_id} did not reach the server (state {status})");
                    self.on_failed(msg_id, false);
                }
                0 if answer_msg_id != 0 => {
                    log::warn!("message info with state 0 for {msg_id}, answer {answer_msg_id}");
                    self.on_failed(msg_id, false);
                    return;
                }
                0 | 4 => self.on_acked(msg_id, false),
                _ => {}
            }
        }

        if answer_msg_id != 0 && !self.state.was_received(answer_msg_id) {
            log::debug!("answer {answer_msg_id} to {msg_id} was not received, requesting it");
            self.queued_resend_req.push(answer_msg_id);
        }
    }

    fn on_acked(&mut self, msg_id: i64, in_container: bool) {
        match self.pending.get(&msg_id) {
            Some(Pending::Container(_)) => {
                if let Some(Pending::Container(children)) = self.pending.remove(&msg_id) {
                    for child in children {
                        self.on_acked(child, true);
                    }
                }
            }
            Some(Pending::Rpc(id)) => {
                let id = *id;
                let Some(rpc) = self.rpcs.get_mut(&id) else { return };
                rpc.acked = true;
                if let Some(t) = rpc.state_timer.take() {
                    self.timers.cancel(t);
                }
                let container_id = rpc.container_id;
                self.queued_state_req.retain(|m| *m != msg_id);
                self.queued_resend_req.retain(|m| *m != msg_id);
                if !in_container {
                    if let Some(cid) = container_id {
                        self.on_acked(cid, true);
                    }
                }
            }
            // Service queries are done once answered, an ack alone changes nothing.
            Some(_) | None => {}
        }
    }

    fn on_failed(&mut self, msg_id: i64, in_container: bool) {
        let Some(pending) = self.pending.remove(&msg_id) else {
            log::debug!("failed message {msg_id} is not pending");
            return;
        };
        log::debug!("{} message {msg_id} failed, resending", pending.kind());

        match pending {
            Pending::Container(children) => {
                for child in children {
                    self.on_failed(child, true);
                }
            }
            Pending::Rpc(id) => {
                let Some(rpc) = self.rpcs.get_mut(&id) else { return };
                let container_id = rpc.container_id.take();
                rpc.msg_id = None;
                rpc.acked = false;
                if let Some(t) = rpc.state_timer.take() {
                    self.timers.cancel(t);
                }
                if rpc.cancelled {
                    self.rpcs.remove(&id);
                } else {
                    self.queued_rpc.push_back(id);
                }
                if !in_container {
                    if let Some(cid) = container_id {
                        self.on_failed(cid, true);
                    }
                }
            }
            Pending::Ping { .. } => {
                self.last_ping = None;
            }
            Pending::StateReq { msg_ids, .. } => self.queued_state_req.extend(msg_ids),
            Pending::ResendReq { msg_ids, .. } => self.queued_resend_req.extend(msg_ids),
            Pending::Cancel { req_msg_id, .. } => self.queued_cancel.push(req_msg_id),
            Pending::DestroySession { session_id, .. } => self.queued_destroy.push(session_id),
            Pending::FutureSalts { .. } => self.salts.set_fetching(false),
        }
    }
}

/// The body of an `rpc_result`, inflated if the server gzipped it.
fn unpack_result(result: Blob) -> Result<Vec<u8>, SessionError> {
    if result.constructor_id() == Some(GzipPacked::CONSTRUCTOR_ID) {
        let Boxed(gz) = Boxed::<GzipPacked>::from_bytes(&result.0)?;
        return gz_inflate(&gz.packed_data);
    }
    Ok(result.0)
}
