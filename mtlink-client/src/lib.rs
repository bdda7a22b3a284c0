//! # mtlink-client
//!
//! Async MTProto client runtime.
//!
//! ## Features
//! - One encrypted session per DC, each driven by its own task, reconnecting
//!   with paced backoff
//! - Every call goes through a middleware pipeline: flood-wait sleeping,
//!   internal-error retry, `*_MIGRATE_X` redirects, per-call timeout and abort
//! - Server config cache with coalesced refreshes
//! - Update reconciliation: pts/qts/seq gap detection, postponement and
//!   difference-based recovery, per-channel catch-up
//! - Pluggable storage, transport and crypto; portable string sessions
//!
//! The RPC schema is not part of this crate. Requests are any
//! [`RemoteCall`]; updates are classified by an [`UpdatesSource`].
//!
//! ```rust,no_run
//! # async fn f() -> Result<(), mtlink_client::InvocationError> {
//! use mtlink_client::{Client, Config};
//!
//! let client = Client::connect(Config::default()).await?;
//! let mut updates = client.subscribe_updates();
//! while let Ok(update) = updates.recv().await {
//!     println!("{} bytes", update.body.len());
//! }
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod connection;
mod errors;
mod reconciler;
mod session;
mod socks5;

pub mod config;
pub mod dc_pool;
pub mod pipeline;
pub mod pts;
pub mod retry;
pub mod storage;
pub mod transport;
pub mod update;

pub use config::{ConfigManager, ConfigSource, DcOption, FindOption, ServerConfig, StaticConfig};
pub use connection::ConnectionHandle;
pub use dc_pool::{DcPool, Migration};
pub use errors::{InvocationError, RpcError};
pub use pipeline::{BoxFuture, CallOptions, CallResult, Middleware, Next, Pipeline, RpcCall, RpcSender};
pub use pts::UpdatesState;
pub use retry::{FloodWaiter, InternalErrors, NoRetries, Retry, RetryContext, RetryPolicy};
pub use session::StringSession;
pub use socks5::Socks5Config;
pub use storage::{InMemoryStorage, SelfInfo, SessionStorage, StoredDcs};
pub use transport::{TcpTransport, Transport, TransportKind};
pub use update::{ChannelDifference, Difference, RawUpdate, Sequencing, Updates, UpdatesSource};

pub use mtlink_mtproto::SessionConfig;

use std::sync::Arc;

use mtlink_crypto::{CryptoProvider, DefaultCryptoProvider};
use mtlink_tl_types::{Deserializable, RemoteCall};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use connection::{Clock, ConnectionEnv};
use reconciler::ReconcilerHandle;

// ─── Config ───────────────────────────────────────────────────────────────────

/// Everything [`Client::connect`] needs.
pub struct Config {
    /// DC used when storage does not name one.
    pub primary_dc: i32,
    /// Where DC addresses come from (default: the bootstrap production table).
    pub config_source: Arc<dyn ConfigSource>,
    /// Packet framing (default: intermediate).
    pub transport: TransportKind,
    /// Optional SOCKS5 proxy; every connection is tunnelled through it.
    pub socks5: Option<Socks5Config>,
    /// Replaces TCP entirely. `socks5` is ignored when set.
    pub custom_transport: Option<Arc<dyn Transport>>,
    pub allow_ipv6: bool,
    pub prefer_ipv6: bool,
    /// Keys, salts, update state and DC table (default: in memory).
    pub storage: Arc<dyn SessionStorage>,
    pub crypto: Arc<dyn CryptoProvider>,
    /// Extra middlewares, run before the built-in ones.
    pub middlewares: Vec<Arc<dyn Middleware>>,
    /// `None` disables transparent flood-wait sleeping.
    pub flood_waiter: Option<FloodWaiter>,
    /// `None` disables internal-error retries.
    pub internal_retry: Option<InternalErrors>,
    /// Used by [`Client::invoke`].
    pub call_options: CallOptions,
    pub session: SessionConfig,
    /// Without one, updates are passed on unordered and nothing is
    /// reconciled.
    pub updates_source: Option<Arc<dyn UpdatesSource>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary_dc: 2,
            config_source: Arc::new(StaticConfig::production()),
            transport: TransportKind::default(),
            socks5: None,
            custom_transport: None,
            allow_ipv6: false,
            prefer_ipv6: false,
            storage: Arc::new(InMemoryStorage::new()),
            crypto: Arc::new(DefaultCryptoProvider),
            middlewares: Vec::new(),
            flood_waiter: Some(FloodWaiter::default()),
            internal_retry: Some(InternalErrors::default()),
            call_options: CallOptions::default(),
            session: SessionConfig::default(),
            updates_source: None,
        }
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

enum UpdateFeed {
    Reconciled(ReconcilerHandle),
    Raw(broadcast::Sender<RawUpdate>),
}

struct ClientInner {
    pool: Arc<DcPool>,
    pipeline: Arc<Pipeline>,
    config: Arc<ConfigManager>,
    storage: Arc<dyn SessionStorage>,
    call_options: CallOptions,
    updates: UpdateFeed,
    shutdown: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.config.destroy();
    }
}

/// An MTProto client. Cheap to clone; dropping the last clone stops every
/// connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Start the client and its connection to the primary DC.
    ///
    /// The auth key of the primary DC must already be in storage (see
    /// [`Client::import_session`]).
    pub async fn connect(config: Config) -> Result<Self, InvocationError> {
        let storage = config.storage.clone();
        let primary_dc = match storage.dcs()? {
            Some(dcs) => dcs.main.id,
            None => config.primary_dc,
        };
        tracing::info!("[mtlink] starting client (DC{primary_dc}, storage: {})", storage.name());

        let shutdown = CancellationToken::new();
        let transport: Arc<dyn Transport> = match config.custom_transport {
            Some(t) => t,
            None => Arc::new(TcpTransport::new(config.socks5)),
        };
        let env = Arc::new(ConnectionEnv {
            transport,
            transport_kind: config.transport,
            crypto: config.crypto,
            storage: storage.clone(),
            session_config: config.session,
            clock: Clock::new(),
        });
        let manager = ConfigManager::new(config.config_source);

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(DcPool::new(
            env,
            manager.clone(),
            primary_dc,
            (config.allow_ipv6, config.prefer_ipv6),
            raw_tx,
            shutdown.clone(),
        ));

        let mut middlewares = config.middlewares;
        if let Some(waiter) = config.flood_waiter {
            middlewares.push(Arc::new(waiter));
        }
        if let Some(policy) = config.internal_retry {
            middlewares.push(Arc::new(Retry(policy)));
        }
        middlewares.push(Arc::new(Migration::new(pool.clone())));
        let pipeline = Arc::new(Pipeline::new(middlewares, pool.clone()));

        let updates = match config.updates_source {
            Some(source) => UpdateFeed::Reconciled(reconciler::spawn(
                source,
                pipeline.clone(),
                storage.clone(),
                raw_rx,
                shutdown.clone(),
            )),
            None => UpdateFeed::Raw(reconciler::spawn_passthrough(raw_rx, shutdown.clone())),
        };

        let inner = Arc::new(ClientInner {
            pool,
            pipeline,
            config: manager,
            storage,
            call_options: config.call_options,
            updates,
            shutdown,
        });
        inner.pool.connection(primary_dc).await?;
        Ok(Self { inner })
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    /// Call `req` with the default [`CallOptions`].
    pub async fn invoke<R: RemoteCall>(&self, req: &R) -> Result<R::Return, InvocationError> {
        self.call(req, self.inner.call_options.clone()).await
    }

    pub async fn call<R: RemoteCall>(&self, req: &R, options: CallOptions) -> Result<R::Return, InvocationError> {
        let body = self.call_raw(req.to_bytes(), options).await?;
        Ok(R::Return::from_bytes(&body)?)
    }

    /// Send an already serialized request and return the serialized answer.
    pub async fn call_raw(&self, body: Vec<u8>, options: CallOptions) -> Result<Vec<u8>, InvocationError> {
        self.inner.pipeline.call(RpcCall::new(body, options)).await
    }

    pub fn primary_dc(&self) -> i32 { self.inner.pool.primary_dc() }

    pub fn config(&self) -> &Arc<ConfigManager> { &self.inner.config }

    // ── Updates ──────────────────────────────────────────────────────────────

    /// Receive every update from now on. Dropping the receiver unsubscribes.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<RawUpdate> {
        match &self.inner.updates {
            UpdateFeed::Reconciled(r) => r.subscribe(),
            UpdateFeed::Raw(tx) => tx.subscribe(),
        }
    }

    /// The reconciled update state, once known.
    pub fn updates_state(&self) -> Option<UpdatesState> {
        match &self.inner.updates {
            UpdateFeed::Reconciled(r) => r.state(),
            UpdateFeed::Raw(_) => None,
        }
    }

    /// The user is looking at a channel: catch it up now and keep polling it
    /// at the server's suggested interval. Calls nest; returns `true` on the
    /// first one.
    pub fn notify_channel_opened(&self, channel_id: i64, pts: Option<i32>) -> bool {
        match &self.inner.updates {
            UpdateFeed::Reconciled(r) => r.channel_opened(channel_id, pts),
            UpdateFeed::Raw(_) => false,
        }
    }

    /// Undo one [`notify_channel_opened`](Self::notify_channel_opened).
    /// Returns `true` when the channel is no longer open.
    pub fn notify_channel_closed(&self, channel_id: i64) -> bool {
        match &self.inner.updates {
            UpdateFeed::Reconciled(r) => r.channel_closed(channel_id),
            UpdateFeed::Raw(_) => false,
        }
    }

    /// Fetch whatever happened while the client was away.
    pub fn catch_up(&self) {
        if let UpdateFeed::Reconciled(r) = &self.inner.updates {
            r.catch_up();
        }
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Write a string session into `storage`, ready for [`Client::connect`].
    pub fn import_session(storage: &dyn SessionStorage, session: &str) -> Result<StringSession, InvocationError> {
        let session = StringSession::decode(session)?;
        storage.set_dcs(&session.dcs)?;
        storage.set_auth_key(session.dcs.main.id, Some(&session.auth_key))?;
        storage.set_self_info(session.self_info)?;
        tracing::info!("[mtlink] imported session for DC{}", session.dcs.main.id);
        Ok(session)
    }

    /// Pack the primary DC and its auth key into a string session.
    pub async fn export_session(&self) -> Result<String, InvocationError> {
        let dc_id = self.primary_dc();
        let dcs = match self.inner.storage.dcs()? {
            Some(dcs) if dcs.main.id == dc_id => dcs,
            _ => {
                let main = self.inner.pool.resolve(dc_id).await?;
                StoredDcs { main: main.clone(), media: main }
            }
        };
        let auth_key = self
            .inner
            .storage
            .auth_key(dc_id)?
            .ok_or_else(|| InvocationError::Argument(format!("no auth key for DC{dc_id}")))?;
        let self_info = self.inner.storage.self_info()?;
        Ok(StringSession { dcs, self_info, auth_key }.encode())
    }

    /// Stop every connection. Pending calls fail with
    /// [`InvocationError::Dropped`].
    pub async fn disconnect(&self) {
        tracing::info!("[mtlink] disconnecting");
        self.inner.pool.disconnect_all().await;
        self.inner.shutdown.cancel();
        self.inner.config.destroy();
    }
}
