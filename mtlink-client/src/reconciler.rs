//! Update gap detection and recovery.
//!
//! The reconciler is a task fed with every `Updates` push of the main
//! connection. It keeps the account's [`UpdatesState`] and per-channel pts,
//! delivers updates to subscribers strictly in counter order, and fills
//! gaps with difference calls:
//!
//! 1. Containers are checked against `seq`, lowest `seq_start` first. Their
//!    updates are sorted into the pts queue, the qts queue or the unordered
//!    queue.
//! 2. pts/qts-ordered updates are applied when next in line, dropped when
//!    already applied, held back for 500ms on small gaps and recovered with
//!    a difference otherwise.
//! 3. Requested differences are fetched one at a time, each stream at most
//!    once per tick. Their results land in the queues for the next step.
//! 4. Unordered updates are delivered, and the state is saved.
//!
//! A gap in one channel never holds back another channel or the global
//! stream.
//!
//! Fifteen minutes without a push trigger a catch up, so a failed
//! difference is retried even when the server stays quiet.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::InvocationError;
use crate::pipeline::Pipeline;
use crate::pts::{GapCheck, SeqCheck, UpdatesState, check_gap, check_seq};
use crate::storage::SessionStorage;
use crate::update::{ChannelDifference, Difference, RawUpdate, Sequencing, Updates, UpdatesSource};

const POSTPONE: Duration = Duration::from_millis(500);
/// Without any push for this long, a difference is fetched anyway.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15 * 60);
const CHANNEL_LIMIT: i32 = 100;
const EVENT_CAPACITY: usize = 1024;

// ─── Handle ───────────────────────────────────────────────────────────────────

enum Input {
    Updates(Updates),
    CatchUp,
}

/// Client-side end of the reconciler.
pub(crate) struct ReconcilerHandle {
    tx: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<RawUpdate>,
    state: watch::Receiver<Option<UpdatesState>>,
    opened: Arc<Mutex<HashMap<i64, u32>>>,
}

impl ReconcilerHandle {
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RawUpdate> { self.events.subscribe() }

    pub(crate) fn state(&self) -> Option<UpdatesState> { *self.state.borrow() }

    /// Returns `true` when the channel was not open before.
    pub(crate) fn channel_opened(&self, channel_id: i64, pts: Option<i32>) -> bool {
        {
            let mut opened = lock(&self.opened);
            let count = opened.entry(channel_id).or_insert(0);
            *count += 1;
            if *count > 1 {
                tracing::debug!("[mtlink] channel {channel_id} opened {} times", *count);
                return false;
            }
        }
        tracing::debug!("[mtlink] channel {channel_id} opened (pts {pts:?})");
        let _ = self.tx.send(Input::Updates(channel_too_long(channel_id, pts)));
        true
    }

    /// Returns `true` when the channel is no longer open at all.
    pub(crate) fn channel_closed(&self, channel_id: i64) -> bool {
        let mut opened = lock(&self.opened);
        match opened.get_mut(&channel_id) {
            None => false,
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                opened.remove(&channel_id);
                tracing::debug!("[mtlink] channel {channel_id} closed");
                true
            }
        }
    }

    pub(crate) fn catch_up(&self) { let _ = self.tx.send(Input::CatchUp); }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

fn channel_too_long(channel_id: i64, pts: Option<i32>) -> Updates {
    Updates::Batch {
        updates: vec![RawUpdate::new(Vec::new(), Sequencing::ChannelTooLong { channel_id, pts })],
        seq_start: 0,
        seq: 0,
        date: 0,
    }
}

/// Start reconciling the pushes arriving on `raw`.
pub(crate) fn spawn(
    source: Arc<dyn UpdatesSource>,
    pipeline: Arc<Pipeline>,
    storage: Arc<dyn SessionStorage>,
    raw: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) -> ReconcilerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let (state_tx, state_rx) = watch::channel(None);
    let opened = Arc::new(Mutex::new(HashMap::new()));

    let reconciler = Reconciler {
        source,
        pipeline,
        storage,
        raw,
        rx,
        tx: tx.clone(),
        events: events.clone(),
        snapshot: state_tx,
        opened: opened.clone(),
        shutdown,
        state: None,
        saved: None,
        cpts: HashMap::new(),
        cpts_mod: HashMap::new(),
        containers: Vec::new(),
        pts_queue: Vec::new(),
        pts_postponed: Vec::new(),
        qts_queue: Vec::new(),
        qts_postponed: Vec::new(),
        unordered: VecDeque::new(),
        postponed_expired: false,
        catching_up: false,
        keep_alive: Instant::now() + KEEP_ALIVE_INTERVAL,
        channel_timers: HashMap::new(),
    };
    tokio::spawn(reconciler.run());
    ReconcilerHandle { tx, events, state: state_rx, opened }
}

/// Without an [`UpdatesSource`] nothing can be ordered: pushes are passed on
/// as they come.
pub(crate) fn spawn_passthrough(
    mut raw: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) -> broadcast::Sender<RawUpdate> {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let out = events.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                body = raw.recv() => match body {
                    Some(body) => {
                        let _ = out.send(RawUpdate::unordered(body));
                    }
                    None => break,
                },
            }
        }
    });
    events
}

// ─── Reconciler ───────────────────────────────────────────────────────────────

struct Ordered {
    update: RawUpdate,
    channel_id: Option<i64>,
    before: i32,
    after: i32,
    deadline: Instant,
}

/// Differences requested during one tick. Channel entries carry a fallback
/// pts for channels without a known one.
#[derive(Default)]
struct Requested {
    common: bool,
    channels: BTreeMap<i64, Option<i32>>,
}

impl Requested {
    fn channel(&mut self, channel_id: i64, pts: Option<i32>) {
        let entry = self.channels.entry(channel_id).or_insert(None);
        if entry.is_none() {
            *entry = pts;
        }
    }

    fn is_empty(&self) -> bool { !self.common && self.channels.is_empty() }
}

struct Reconciler {
    source: Arc<dyn UpdatesSource>,
    pipeline: Arc<Pipeline>,
    storage: Arc<dyn SessionStorage>,
    raw: mpsc::UnboundedReceiver<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Input>,
    tx: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<RawUpdate>,
    snapshot: watch::Sender<Option<UpdatesState>>,
    opened: Arc<Mutex<HashMap<i64, u32>>>,
    shutdown: CancellationToken,

    state: Option<UpdatesState>,
    saved: Option<UpdatesState>,
    cpts: HashMap<i64, i32>,
    /// Channel pts changed since the last save.
    cpts_mod: HashMap<i64, i32>,

    /// Sorted by `seq_start`; containers without a seq come first.
    containers: Vec<Updates>,
    pts_queue: Vec<Ordered>,
    pts_postponed: Vec<Ordered>,
    qts_queue: Vec<Ordered>,
    qts_postponed: Vec<Ordered>,
    unordered: VecDeque<RawUpdate>,
    postponed_expired: bool,
    catching_up: bool,
    keep_alive: Instant,
    channel_timers: HashMap<i64, JoinHandle<()>>,
}

/// Insert keeping the queue sorted by predecessor value, FIFO among equals.
fn insert_sorted(queue: &mut Vec<Ordered>, item: Ordered) {
    let at = queue.partition_point(|o| o.before <= item.before);
    queue.insert(at, item);
}

fn seq_start(container: &Updates) -> i32 {
    match container {
        Updates::Batch { seq_start, .. } => *seq_start,
        Updates::TooLong | Updates::Short(_) => 0,
    }
}

impl Reconciler {
    async fn run(mut self) {
        match self.storage.updates_state() {
            Ok(Some(state)) => {
                tracing::debug!(
                    "[mtlink] loaded update state: pts={} qts={} date={} seq={}",
                    state.pts,
                    state.qts,
                    state.date,
                    state.seq
                );
                self.state = Some(state);
                self.saved = Some(state);
                self.snapshot.send_replace(Some(state));
            }
            Ok(None) => self.fetch_state().await,
            Err(e) => {
                tracing::warn!("[mtlink] failed to load update state: {e}");
                self.fetch_state().await;
            }
        }

        loop {
            if !self.has_work() {
                if self.catching_up {
                    tracing::debug!("[mtlink] catching up completed");
                    self.catching_up = false;
                }
                let deadline = self.postponed_deadline();
                let expired = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    body = self.raw.recv() => match body {
                        Some(body) => self.on_raw(&body),
                        None => break,
                    },
                    input = self.rx.recv() => match input {
                        Some(input) => self.on_input(input),
                        None => break,
                    },
                    _ = expired => self.postponed_expired = true,
                    _ = tokio::time::sleep_until(self.keep_alive) => {
                        tracing::debug!("[mtlink] no updates for 15 minutes, catching up");
                        self.keep_alive = Instant::now() + KEEP_ALIVE_INTERVAL;
                        self.on_input(Input::CatchUp);
                    }
                }
            }
            while let Ok(body) = self.raw.try_recv() {
                self.on_raw(&body);
            }
            while let Ok(input) = self.rx.try_recv() {
                self.on_input(input);
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            self.tick().await;
        }

        for (_, t) in self.channel_timers.drain() {
            t.abort();
        }
        tracing::debug!("[mtlink] updates loop stopped");
    }

    fn has_work(&self) -> bool {
        !self.containers.is_empty()
            || !self.pts_queue.is_empty()
            || !self.qts_queue.is_empty()
            || !self.unordered.is_empty()
            || self.postponed_expired
    }

    fn postponed_deadline(&self) -> Option<Instant> {
        self.pts_postponed.iter().chain(&self.qts_postponed).map(|o| o.deadline).min()
    }

    fn on_raw(&mut self, body: &[u8]) {
        self.keep_alive = Instant::now() + KEEP_ALIVE_INTERVAL;
        match self.source.decode(body) {
            Ok(updates) => self.push_container(updates),
            Err(e) => tracing::warn!("[mtlink] failed to decode updates: {e}"),
        }
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::Updates(updates) => self.push_container(updates),
            Input::CatchUp => {
                tracing::debug!("[mtlink] catch up requested");
                self.catching_up = true;
                self.push_container(Updates::TooLong);
            }
        }
    }

    fn push_container(&mut self, container: Updates) {
        let key = seq_start(&container);
        let at = self.containers.partition_point(|c| seq_start(c) <= key);
        self.containers.insert(at, container);
    }

    // ── One pass over the queues ──────────────────────────────────────────────

    async fn tick(&mut self) {
        let mut requested = Requested::default();

        while !self.containers.is_empty() {
            let container = self.containers.remove(0);
            self.on_container(container, &mut requested).await;
        }

        self.process_pts(&mut requested).await;
        self.process_pts_postponed(&mut requested);
        self.process_qts(&mut requested);
        self.process_qts_postponed(&mut requested);
        self.postponed_expired = false;

        self.fetch_requested(&mut requested).await;

        while let Some(update) = self.unordered.pop_front() {
            self.deliver(update);
        }

        self.fetch_requested(&mut requested).await;
        self.save();
    }

    async fn on_container(&mut self, container: Updates, requested: &mut Requested) {
        match container {
            Updates::TooLong => {
                tracing::debug!("[mtlink] updatesTooLong, fetching difference");
                requested.common = true;
            }
            Updates::Short(update) => self.classify(update, requested).await,
            Updates::Batch { updates, seq_start, seq, date } => {
                if seq_start != 0 {
                    if let Some(state) = self.state {
                        match check_seq(state.seq, seq_start) {
                            SeqCheck::Duplicate => {
                                tracing::debug!("[mtlink] ignoring container seq_start={seq_start}, already applied");
                                return;
                            }
                            SeqCheck::Gap => {
                                tracing::debug!(
                                    "[mtlink] seq gap (expected {}, got {seq_start}), fetching difference",
                                    state.seq + 1
                                );
                                requested.common = true;
                            }
                            SeqCheck::Apply => {}
                        }
                    }
                }
                for update in updates {
                    self.classify(update, requested).await;
                }
                if let Some(state) = self.state.as_mut() {
                    if seq != 0 && seq > state.seq {
                        state.seq = seq;
                        state.date = date;
                    }
                }
            }
        }
    }

    async fn classify(&mut self, update: RawUpdate, requested: &mut Requested) {
        let now = Instant::now();
        match update.kind {
            Sequencing::ChannelTooLong { channel_id, pts } => {
                tracing::debug!("[mtlink] channel {channel_id} too long (pts {pts:?}), fetching difference");
                requested.channel(channel_id, pts);
            }
            Sequencing::PtsChanged => {
                tracing::debug!("[mtlink] pts changed on the server, fetching state");
                self.fetch_state().await;
            }
            Sequencing::Pts { channel_id, pts, pts_count } => insert_sorted(
                &mut self.pts_queue,
                Ordered { update, channel_id, before: pts - pts_count, after: pts, deadline: now },
            ),
            Sequencing::Qts { qts } => insert_sorted(
                &mut self.qts_queue,
                Ordered { update, channel_id: None, before: qts - 1, after: qts, deadline: now },
            ),
            Sequencing::Unordered => self.unordered.push_back(update),
        }
    }

    /// Local pts of the stream an update belongs to. Unknown (or zero)
    /// counters accept anything.
    fn local_pts(&mut self, channel_id: Option<i64>) -> Option<i32> {
        let local = match channel_id {
            None => self.state.map(|s| s.pts),
            Some(c) => match self.cpts.get(&c) {
                Some(p) => Some(*p),
                None if self.catching_up => match self.storage.channel_pts(c) {
                    Ok(Some(p)) => {
                        self.cpts.insert(c, p);
                        Some(p)
                    }
                    _ => None,
                },
                None => None,
            },
        };
        local.filter(|p| *p != 0)
    }

    async fn process_pts(&mut self, requested: &mut Requested) {
        while !self.pts_queue.is_empty() {
            let mut item = self.pts_queue.remove(0);
            if let Some(local) = self.local_pts(item.channel_id) {
                match check_gap(local, item.before) {
                    GapCheck::Apply => {}
                    GapCheck::Drop => tracing::debug!("[mtlink] pts drop detected ({local} -> {})", item.before),
                    GapCheck::Duplicate => {
                        tracing::trace!("[mtlink] ignoring pts {} (local {local}), already applied", item.after);
                        continue;
                    }
                    GapCheck::Postpone => {
                        tracing::debug!(
                            "[mtlink] small pts gap (local {local}, before {}), postponing",
                            item.before
                        );
                        item.deadline = Instant::now() + POSTPONE;
                        insert_sorted(&mut self.pts_postponed, item);
                        continue;
                    }
                    GapCheck::Gap => {
                        tracing::debug!(
                            "[mtlink] pts gap (channel {:?}, local {local}, before {}), fetching difference",
                            item.channel_id,
                            item.before
                        );
                        match item.channel_id {
                            Some(c) => requested.channel(c, None),
                            None => requested.common = true,
                        }
                        continue;
                    }
                    GapCheck::TooLarge => {
                        tracing::warn!("[mtlink] pts gap too large (local {local}, before {}), resetting", item.before);
                        match item.channel_id {
                            Some(c) => {
                                self.cpts.insert(c, 0);
                                self.cpts_mod.insert(c, 0);
                            }
                            None => self.fetch_state().await,
                        }
                        continue;
                    }
                }
            }
            self.apply(item);
        }
    }

    fn process_pts_postponed(&mut self, requested: &mut Requested) {
        let now = Instant::now();
        for item in std::mem::take(&mut self.pts_postponed) {
            let Some(local) = self.local_pts(item.channel_id) else {
                tracing::warn!("[mtlink] no local pts for postponed update, dropping it");
                continue;
            };
            if local > item.before {
                continue;
            }
            if local < item.before {
                if now < item.deadline {
                    self.pts_postponed.push(item);
                } else {
                    tracing::debug!("[mtlink] pts gap was not filled in time, fetching difference");
                    match item.channel_id {
                        Some(c) => requested.channel(c, None),
                        None => requested.common = true,
                    }
                }
                continue;
            }
            self.apply(item);
        }
    }

    fn local_qts(&self) -> Option<i32> { self.state.map(|s| s.qts).filter(|q| *q != 0) }

    fn process_qts(&mut self, requested: &mut Requested) {
        while !self.qts_queue.is_empty() {
            let mut item = self.qts_queue.remove(0);
            if let Some(local) = self.local_qts() {
                match check_gap(local, item.before) {
                    GapCheck::Apply | GapCheck::Drop => {}
                    GapCheck::Duplicate => continue,
                    GapCheck::Postpone => {
                        item.deadline = Instant::now() + POSTPONE;
                        insert_sorted(&mut self.qts_postponed, item);
                        continue;
                    }
                    GapCheck::Gap | GapCheck::TooLarge => {
                        tracing::debug!("[mtlink] qts gap (local {local}, before {}), fetching difference", item.before);
                        requested.common = true;
                        continue;
                    }
                }
            }
            self.apply(item);
        }
    }

    fn process_qts_postponed(&mut self, requested: &mut Requested) {
        let now = Instant::now();
        for item in std::mem::take(&mut self.qts_postponed) {
            let local = self.local_qts().unwrap_or(item.before);
            if local > item.before {
                continue;
            }
            if local < item.before {
                if now < item.deadline {
                    self.qts_postponed.push(item);
                } else {
                    requested.common = true;
                }
                continue;
            }
            self.apply(item);
        }
    }

    /// Move the counter past an ordered update and deliver it.
    fn apply(&mut self, item: Ordered) {
        match (item.update.kind, item.channel_id) {
            (Sequencing::Pts { .. }, Some(c)) => {
                self.cpts.insert(c, item.after);
                self.cpts_mod.insert(c, item.after);
            }
            (Sequencing::Pts { .. }, None) => {
                if let Some(s) = self.state.as_mut() {
                    s.pts = item.after;
                }
            }
            (Sequencing::Qts { .. }, _) => {
                if let Some(s) = self.state.as_mut() {
                    s.qts = item.after;
                }
            }
            _ => {}
        }
        self.deliver(item.update);
    }

    fn deliver(&self, update: RawUpdate) {
        if update.is_internal() {
            return;
        }
        // No receivers is not an error.
        let _ = self.events.send(update);
    }

    // ── Differences ───────────────────────────────────────────────────────────

    async fn fetch_requested(&mut self, requested: &mut Requested) {
        while !requested.is_empty() {
            if let Some((channel_id, fallback)) = requested.channels.pop_first() {
                match self.fetch_channel_difference(channel_id, fallback).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!("[mtlink] channel {channel_id} difference unavailable, using common difference");
                        requested.common = true;
                    }
                    Err(e) => {
                        tracing::warn!("[mtlink] channel {channel_id} difference failed: {e}");
                        requested.common = true;
                    }
                }
                continue;
            }
            requested.common = false;
            if let Err(e) = self.fetch_difference(requested).await {
                tracing::warn!("[mtlink] difference failed: {e}");
                if e.is("PERSISTENT_TIMESTAMP_INVALID") {
                    self.fetch_state().await;
                }
            }
        }
    }

    async fn fetch_difference(&mut self, requested: &mut Requested) -> Result<(), InvocationError> {
        let Some(state) = self.state else {
            self.fetch_state().await;
            return Ok(());
        };
        let source = self.source.clone();
        let diff = source.get_difference(&self.pipeline, state).await?;
        match diff {
            Difference::Empty { date, seq } => {
                tracing::debug!("[mtlink] difference empty");
                if let Some(s) = self.state.as_mut() {
                    s.date = date;
                    s.seq = seq;
                }
            }
            Difference::TooLong { pts } => {
                tracing::debug!("[mtlink] difference too long, pts -> {pts}");
                if let Some(s) = self.state.as_mut() {
                    s.pts = pts;
                }
            }
            Difference::Difference { new_messages, other_updates, state: fetched, is_final } => {
                tracing::debug!(
                    "[mtlink] difference: {} messages, {} updates, pts {} qts {} seq {}, final {is_final}",
                    new_messages.len(),
                    other_updates.len(),
                    fetched.pts,
                    fetched.qts,
                    fetched.seq
                );
                self.unordered.extend(new_messages);
                let now = Instant::now();
                for update in other_updates {
                    match update.kind {
                        Sequencing::ChannelTooLong { channel_id, pts } => requested.channel(channel_id, pts),
                        Sequencing::Pts { channel_id: Some(c), pts, pts_count } => insert_sorted(
                            &mut self.pts_queue,
                            Ordered { update, channel_id: Some(c), before: pts - pts_count, after: pts, deadline: now },
                        ),
                        _ => self.unordered.push_back(update),
                    }
                }
                self.state = Some(fetched);
                if !is_final {
                    self.push_container(Updates::TooLong);
                }
            }
        }
        Ok(())
    }

    /// Catch a channel up. `Ok(false)` when there is no pts to start from.
    async fn fetch_channel_difference(&mut self, channel_id: i64, fallback: Option<i32>) -> Result<bool, InvocationError> {
        if let Some(t) = self.channel_timers.remove(&channel_id) {
            t.abort();
        }

        let mut pts = self.cpts.get(&channel_id).copied().filter(|p| *p != 0);
        if pts.is_none() && self.catching_up {
            pts = self.storage.channel_pts(channel_id)?.filter(|p| *p != 0);
        }
        let Some(mut pts) = pts.or(fallback.filter(|p| *p != 0)) else {
            tracing::debug!("[mtlink] channel {channel_id}: no base pts");
            return Ok(false);
        };

        let mut limit = CHANNEL_LIMIT;
        if pts <= 0 {
            pts = 1;
            limit = 1;
        }

        let source = self.source.clone();
        let mut last_timeout = 0;
        loop {
            let diff = source.get_channel_difference(&self.pipeline, channel_id, pts, limit).await?;
            match diff {
                ChannelDifference::Empty { pts: server_pts, timeout } => {
                    tracing::debug!("[mtlink] channel {channel_id} difference empty");
                    pts = server_pts;
                    last_timeout = timeout.unwrap_or(last_timeout);
                    break;
                }
                ChannelDifference::TooLong { dialog_pts, messages, timeout } => {
                    if let Some(p) = dialog_pts {
                        pts = p;
                    }
                    tracing::warn!(
                        "[mtlink] channel {channel_id} difference too long, new pts {pts}, {} recent messages",
                        messages.len()
                    );
                    self.unordered.extend(messages);
                    last_timeout = timeout.unwrap_or(last_timeout);
                    break;
                }
                ChannelDifference::Difference { pts: new_pts, is_final, timeout, new_messages, other_updates } => {
                    tracing::debug!(
                        "[mtlink] channel {channel_id} difference: {} messages, {} updates, pts {new_pts}",
                        new_messages.len(),
                        other_updates.len()
                    );
                    self.unordered.extend(new_messages);
                    self.unordered.extend(other_updates);
                    pts = new_pts;
                    last_timeout = timeout.unwrap_or(last_timeout);
                    if is_final {
                        break;
                    }
                }
            }
        }

        self.cpts.insert(channel_id, pts);
        self.cpts_mod.insert(channel_id, pts);

        let is_open = lock(&self.opened).contains_key(&channel_id);
        if last_timeout > 0 && is_open {
            tracing::debug!("[mtlink] polling channel {channel_id} again in {last_timeout}s");
            let tx = self.tx.clone();
            let delay = Duration::from_secs(last_timeout as u64);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Input::Updates(channel_too_long(channel_id, None)));
            });
            self.channel_timers.insert(channel_id, timer);
        }
        Ok(true)
    }

    /// `updates.getState`, refined by one difference since `getState` may
    /// return a stale qts.
    async fn fetch_state(&mut self) {
        let source = self.source.clone();
        let mut state = match source.get_state(&self.pipeline).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("[mtlink] failed to fetch update state: {e}");
                return;
            }
        };
        match source.get_difference(&self.pipeline, state).await {
            Ok(Difference::Empty { .. }) => {}
            Ok(Difference::TooLong { pts }) => state.pts = pts,
            Ok(Difference::Difference { state: fetched, .. }) => state = fetched,
            Err(e) => tracing::warn!("[mtlink] failed to refine update state: {e}"),
        }
        tracing::debug!(
            "[mtlink] fetched update state: pts={} qts={} date={} seq={}",
            state.pts,
            state.qts,
            state.date,
            state.seq
        );
        self.state = Some(state);
    }

    /// Write changed counters through to storage.
    fn save(&mut self) {
        let Some(state) = self.state else { return };
        let saved = self.saved;
        let changed = |f: fn(&UpdatesState) -> i32| saved.is_none_or(|s| f(&s) != f(&state));

        let mut result = Ok(());
        if changed(|s| s.pts) {
            result = result.and(self.storage.set_pts(state.pts));
        }
        if changed(|s| s.qts) {
            result = result.and(self.storage.set_qts(state.qts));
        }
        if changed(|s| s.date) {
            result = result.and(self.storage.set_date(state.date));
        }
        if changed(|s| s.seq) {
            result = result.and(self.storage.set_seq(state.seq));
        }
        for (channel_id, pts) in self.cpts_mod.drain() {
            result = result.and(self.storage.set_channel_pts(channel_id, pts));
        }
        if let Err(e) = result {
            tracing::warn!("[mtlink] failed to save update state: {e}");
        }
        self.saved = Some(state);
        self.snapshot.send_replace(Some(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{BoxFuture, CallResult, RpcCall, RpcSender};
    use crate::storage::InMemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoNetwork;

    impl RpcSender for NoNetwork {
        fn send(&self, _: RpcCall) -> BoxFuture<'_, CallResult> {
            Box::pin(async { Err(InvocationError::Unsupported("network".into())) })
        }
    }

    /// Raw bodies are `[pts, pts_count]` (or `[0, 0]` for a `TooLong`).
    /// Differences come from a script, after `failures` failed calls.
    #[derive(Default)]
    struct Fake {
        failures: AtomicUsize,
        differences: Mutex<VecDeque<Difference>>,
        channel_differences: Mutex<VecDeque<ChannelDifference>>,
        difference_calls: AtomicUsize,
        channel_calls: Mutex<Vec<(i64, i32, i32)>>,
    }

    fn body(pts: i32) -> Vec<u8> { pts.to_le_bytes().to_vec() }

    fn pts_update(channel_id: Option<i64>, pts: i32) -> RawUpdate {
        RawUpdate::new(body(pts), Sequencing::Pts { channel_id, pts, pts_count: 1 })
    }

    fn qts_update(qts: i32) -> RawUpdate { RawUpdate::new(body(qts), Sequencing::Qts { qts }) }

    fn raw(pts: i32) -> Vec<u8> {
        let mut v = pts.to_le_bytes().to_vec();
        v.extend_from_slice(&1i32.to_le_bytes());
        v
    }

    impl UpdatesSource for Fake {
        fn decode(&self, body: &[u8]) -> Result<Updates, InvocationError> {
            let pts = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
            if pts == 0 {
                return Ok(Updates::TooLong);
            }
            Ok(Updates::Short(pts_update(None, pts)))
        }

        fn get_state<'a>(&'a self, _: &'a Pipeline) -> BoxFuture<'a, Result<UpdatesState, InvocationError>> {
            Box::pin(async { Ok(UpdatesState { pts: 1, qts: 1, date: 1, seq: 1 }) })
        }

        fn get_difference<'a>(
            &'a self,
            _: &'a Pipeline,
            state: UpdatesState,
        ) -> BoxFuture<'a, Result<Difference, InvocationError>> {
            self.difference_calls.fetch_add(1, Ordering::SeqCst);
            let failed = self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
            if failed {
                return Box::pin(async { Err(InvocationError::Timeout) });
            }
            let next = self.differences.lock().unwrap().pop_front();
            Box::pin(async move { Ok(next.unwrap_or(Difference::Empty { date: state.date, seq: state.seq })) })
        }

        fn get_channel_difference<'a>(
            &'a self,
            _: &'a Pipeline,
            channel_id: i64,
            pts: i32,
            limit: i32,
        ) -> BoxFuture<'a, Result<ChannelDifference, InvocationError>> {
            self.channel_calls.lock().unwrap().push((channel_id, pts, limit));
            let next = self.channel_differences.lock().unwrap().pop_front();
            Box::pin(async move { Ok(next.unwrap_or(ChannelDifference::Empty { pts, timeout: None })) })
        }
    }

    struct Harness {
        fake: Arc<Fake>,
        raw: mpsc::UnboundedSender<Vec<u8>>,
        handle: ReconcilerHandle,
        events: broadcast::Receiver<RawUpdate>,
        storage: Arc<InMemoryStorage>,
        _shutdown: tokio_util::sync::DropGuard,
    }

    fn start(fake: Fake, pts: i32) -> Harness {
        let fake = Arc::new(fake);
        let storage = Arc::new(InMemoryStorage::new());
        storage.set_pts(pts).unwrap();
        storage.set_qts(5).unwrap();
        storage.set_date(100).unwrap();
        storage.set_seq(7).unwrap();
        let pipeline = Arc::new(Pipeline::new(vec![], Arc::new(NoNetwork)));
        let (raw, raw_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = spawn(fake.clone(), pipeline, storage.clone(), raw_rx, shutdown.clone());
        let events = handle.subscribe();
        Harness { fake, raw, handle, events, storage, _shutdown: shutdown.drop_guard() }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn push(h: &Harness, updates: Updates) { h.handle.tx.send(Input::Updates(updates)).unwrap(); }

    fn drain(rx: &mut broadcast::Receiver<RawUpdate>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(u) = rx.try_recv() {
            out.push(u.body);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn in_order_updates_are_applied_once() {
        let mut h = start(Fake::default(), 10);
        h.raw.send(raw(11)).unwrap();
        h.raw.send(raw(12)).unwrap();
        h.raw.send(raw(12)).unwrap();
        settle().await;

        assert_eq!(drain(&mut h.events), vec![body(11), body(12)]);
        assert_eq!(h.handle.state().map(|s| s.pts), Some(12));
        assert_eq!(h.storage.updates_state().unwrap().map(|s| s.pts), Some(12));
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn small_gap_waits_for_the_missing_update() {
        let mut h = start(Fake::default(), 10);
        h.raw.send(raw(12)).unwrap();
        settle().await;
        assert!(drain(&mut h.events).is_empty());

        h.raw.send(raw(11)).unwrap();
        settle().await;
        assert_eq!(drain(&mut h.events), vec![body(11), body(12)]);
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unfilled_gap_is_recovered_once() {
        let fake = Fake::default();
        fake.differences.lock().unwrap().push_back(Difference::Difference {
            new_messages: vec![],
            other_updates: vec![pts_update(None, 11), pts_update(None, 12), pts_update(None, 13)],
            state: UpdatesState { pts: 13, qts: 5, date: 120, seq: 7 },
            is_final: true,
        });
        let mut h = start(fake, 10);

        // Two steps ahead: held back, then recovered after the grace period.
        h.raw.send(raw(13)).unwrap();
        settle().await;
        assert!(drain(&mut h.events).is_empty());

        tokio::time::sleep(POSTPONE + Duration::from_millis(10)).await;
        settle().await;

        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut h.events), vec![body(11), body(12), body(13)]);
        assert_eq!(h.handle.state().map(|s| s.pts), Some(13));

        h.raw.send(raw(13)).unwrap();
        settle().await;
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn large_gap_fetches_immediately() {
        let fake = Fake::default();
        fake.differences.lock().unwrap().push_back(Difference::TooLong { pts: 50 });
        let h = start(fake, 10);
        h.raw.send(raw(50)).unwrap();
        settle().await;
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.handle.state().map(|s| s.pts), Some(50));
    }

    #[tokio::test(start_paused = true)]
    async fn difference_slices_are_followed() {
        let fake = Fake::default();
        {
            let mut d = fake.differences.lock().unwrap();
            d.push_back(Difference::Difference {
                new_messages: vec![RawUpdate::unordered(vec![1])],
                other_updates: vec![],
                state: UpdatesState { pts: 20, qts: 5, date: 100, seq: 7 },
                is_final: false,
            });
            d.push_back(Difference::Difference {
                new_messages: vec![RawUpdate::unordered(vec![2])],
                other_updates: vec![],
                state: UpdatesState { pts: 30, qts: 5, date: 100, seq: 7 },
                is_final: true,
            });
        }
        let mut h = start(fake, 10);
        h.handle.catch_up();
        settle().await;
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 2);
        assert_eq!(drain(&mut h.events), vec![vec![1], vec![2]]);
        assert_eq!(h.handle.state().map(|s| s.pts), Some(30));
    }

    #[tokio::test(start_paused = true)]
    async fn opened_channel_is_fetched_until_final() {
        let fake = Fake::default();
        {
            let mut d = fake.channel_differences.lock().unwrap();
            d.push_back(ChannelDifference::Difference {
                pts: 150,
                is_final: false,
                timeout: None,
                new_messages: vec![RawUpdate::unordered(vec![7])],
                other_updates: vec![],
            });
            d.push_back(ChannelDifference::Empty { pts: 150, timeout: Some(30) });
        }
        let mut h = start(fake, 10);
        assert!(h.handle.channel_opened(42, Some(100)));
        assert!(!h.handle.channel_opened(42, Some(100)));
        settle().await;

        assert_eq!(*h.fake.channel_calls.lock().unwrap(), vec![(42, 100, 100), (42, 150, 100)]);
        assert_eq!(drain(&mut h.events), vec![vec![7]]);
        assert_eq!(h.storage.channel_pts(42).unwrap(), Some(150));

        // The server's timeout schedules the next poll.
        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(h.fake.channel_calls.lock().unwrap().len(), 3);

        assert!(!h.handle.channel_closed(42));
        assert!(h.handle.channel_closed(42));
        assert!(!h.handle.channel_closed(42));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_gap_does_not_block_the_global_stream() {
        let fake = Fake::default();
        let mut h = start(fake, 10);
        h.handle.channel_opened(9, Some(100));
        settle().await;

        h.handle
            .tx
            .send(Input::Updates(Updates::Batch {
                updates: vec![pts_update(Some(9), 120), pts_update(None, 11)],
                seq_start: 0,
                seq: 0,
                date: 0,
            }))
            .unwrap();
        settle().await;

        assert_eq!(drain(&mut h.events), vec![body(11)]);
        let calls = h.fake.channel_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], (9, 100, 100));
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn seq_gap_requests_a_difference() {
        let h = start(Fake::default(), 10);
        h.handle
            .tx
            .send(Input::Updates(Updates::Batch { updates: vec![], seq_start: 9, seq: 9, date: 200 }))
            .unwrap();
        settle().await;
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 1);

        // Already applied: ignored entirely.
        h.handle
            .tx
            .send(Input::Updates(Updates::Batch { updates: vec![], seq_start: 7, seq: 7, date: 200 }))
            .unwrap();
        settle().await;
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_server_gets_a_keep_alive_difference() {
        let fake = Fake::default();
        fake.failures.store(1, Ordering::SeqCst);
        fake.differences.lock().unwrap().push_back(Difference::Difference {
            new_messages: vec![],
            other_updates: vec![pts_update(None, 11), pts_update(None, 12), pts_update(None, 13)],
            state: UpdatesState { pts: 13, qts: 5, date: 120, seq: 7 },
            is_final: true,
        });
        let mut h = start(fake, 10);

        h.raw.send(raw(13)).unwrap();
        settle().await;
        tokio::time::sleep(POSTPONE + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 1);
        assert!(drain(&mut h.events).is_empty());
        assert_eq!(h.handle.state().map(|s| s.pts), Some(10));

        tokio::time::sleep(KEEP_ALIVE_INTERVAL).await;
        settle().await;
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 2);
        assert_eq!(drain(&mut h.events), vec![body(11), body(12), body(13)]);
        assert_eq!(h.handle.state().map(|s| s.pts), Some(13));
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_delay_the_keep_alive() {
        let h = start(Fake::default(), 10);
        tokio::time::sleep(KEEP_ALIVE_INTERVAL - Duration::from_secs(60)).await;
        h.raw.send(raw(11)).unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(KEEP_ALIVE_INTERVAL).await;
        settle().await;
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn containers_are_applied_in_seq_order() {
        let mut h = start(Fake::default(), 10);
        push(&h, Updates::Batch { updates: vec![pts_update(None, 12)], seq_start: 9, seq: 9, date: 300 });
        push(&h, Updates::Batch { updates: vec![pts_update(None, 11)], seq_start: 8, seq: 8, date: 200 });
        settle().await;

        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 0);
        assert_eq!(drain(&mut h.events), vec![body(11), body(12)]);
        let state = h.handle.state().unwrap();
        assert_eq!((state.pts, state.seq, state.date), (12, 9, 300));
    }

    #[tokio::test(start_paused = true)]
    async fn in_order_qts_updates_are_applied_once() {
        let mut h = start(Fake::default(), 10);
        push(&h, Updates::Short(qts_update(6)));
        push(&h, Updates::Short(qts_update(7)));
        push(&h, Updates::Short(qts_update(7)));
        settle().await;

        assert_eq!(drain(&mut h.events), vec![body(6), body(7)]);
        assert_eq!(h.handle.state().map(|s| s.qts), Some(7));
        assert_eq!(h.storage.updates_state().unwrap().map(|s| s.qts), Some(7));
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn small_qts_gap_waits_for_the_missing_update() {
        let mut h = start(Fake::default(), 10);
        push(&h, Updates::Short(qts_update(7)));
        settle().await;
        assert!(drain(&mut h.events).is_empty());

        push(&h, Updates::Short(qts_update(6)));
        settle().await;
        assert_eq!(drain(&mut h.events), vec![body(6), body(7)]);
        assert_eq!(h.handle.state().map(|s| s.qts), Some(7));
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unfilled_qts_gap_is_recovered() {
        let fake = Fake::default();
        fake.differences.lock().unwrap().push_back(Difference::Difference {
            new_messages: vec![],
            other_updates: vec![qts_update(6), qts_update(7)],
            state: UpdatesState { pts: 10, qts: 7, date: 120, seq: 7 },
            is_final: true,
        });
        let mut h = start(fake, 10);

        push(&h, Updates::Short(qts_update(7)));
        settle().await;
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(POSTPONE + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut h.events), vec![body(6), body(7)]);
        assert_eq!(h.handle.state().map(|s| s.qts), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn large_qts_gap_fetches_immediately() {
        let fake = Fake::default();
        fake.differences.lock().unwrap().push_back(Difference::Difference {
            new_messages: vec![],
            other_updates: vec![],
            state: UpdatesState { pts: 10, qts: 50, date: 120, seq: 7 },
            is_final: true,
        });
        let mut h = start(fake, 10);
        push(&h, Updates::Short(qts_update(50)));
        settle().await;

        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 1);
        assert!(drain(&mut h.events).is_empty());
        assert_eq!(h.handle.state().map(|s| s.qts), Some(50));
    }

    #[tokio::test(start_paused = true)]
    async fn hopeless_channel_gap_resets_its_pts() {
        let mut h = start(Fake::default(), 10);
        h.handle.channel_opened(9, Some(100));
        settle().await;
        assert_eq!(h.storage.channel_pts(9).unwrap(), Some(100));

        push(&h, Updates::Short(pts_update(Some(9), 2_000_100)));
        settle().await;
        assert!(drain(&mut h.events).is_empty());
        assert_eq!(h.storage.channel_pts(9).unwrap(), Some(0));

        // With no pts to compare against, the next update is taken as is.
        push(&h, Updates::Short(pts_update(Some(9), 5)));
        settle().await;
        assert_eq!(drain(&mut h.events), vec![body(5)]);
        assert_eq!(h.storage.channel_pts(9).unwrap(), Some(5));
        assert_eq!(h.fake.channel_calls.lock().unwrap().len(), 1);
        assert_eq!(h.fake.difference_calls.load(Ordering::SeqCst), 0);
    }
}
