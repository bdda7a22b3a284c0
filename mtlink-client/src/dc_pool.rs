//! Multi-DC connection pool.
//!
//! Keeps one [`ConnectionHandle`] per DC, spawned on first use, and routes
//! every call to the DC it targets (the primary DC unless the call says
//! otherwise). [`Migration`] follows the server's `*_MIGRATE_X` redirects.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use mtlink_crypto::AuthKey;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigManager, DcOption, FindOption};
use crate::connection::{self, ConnectionEnv, ConnectionHandle};
use crate::errors::InvocationError;
use crate::pipeline::{BoxFuture, CallResult, Middleware, Next, RpcCall, RpcSender};
use crate::storage::StoredDcs;

/// Pool of per-DC connections.
pub struct DcPool {
    env: Arc<ConnectionEnv>,
    config: Arc<ConfigManager>,
    allow_ipv6: bool,
    prefer_ipv6: bool,
    primary: AtomicI32,
    conns: Mutex<HashMap<i32, ConnectionHandle>>,
    updates: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
}

impl DcPool {
    pub(crate) fn new(
        env: Arc<ConnectionEnv>,
        config: Arc<ConfigManager>,
        primary_dc: i32,
        (allow_ipv6, prefer_ipv6): (bool, bool),
        updates: mpsc::UnboundedSender<Vec<u8>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            env,
            config,
            allow_ipv6,
            prefer_ipv6,
            primary: AtomicI32::new(primary_dc),
            conns: Mutex::new(HashMap::new()),
            updates,
            shutdown,
        }
    }

    pub fn primary_dc(&self) -> i32 { self.primary.load(Ordering::Acquire) }

    /// The address to dial for `dc_id`. The stored main DC wins over the
    /// server config so that a restored session reconnects where it was.
    pub async fn resolve(&self, dc_id: i32) -> Result<DcOption, InvocationError> {
        if let Some(dcs) = self.env.storage.dcs()? {
            if dcs.main.id == dc_id {
                return Ok(dcs.main);
            }
        }
        let params = FindOption {
            dc_id,
            allow_ipv6: self.allow_ipv6,
            prefer_ipv6: self.prefer_ipv6,
            allow_media: false,
            prefer_media: false,
        };
        self.config
            .find_option(params)
            .await?
            .ok_or_else(|| InvocationError::Argument(format!("no known address for DC{dc_id}")))
    }

    /// The connection to `dc_id`, started if needed.
    pub async fn connection(&self, dc_id: i32) -> Result<ConnectionHandle, InvocationError> {
        let mut conns = self.conns.lock().await;
        if let Some(h) = conns.get(&dc_id) {
            if !h.is_closed() {
                return Ok(h.clone());
            }
            conns.remove(&dc_id);
        }

        let key = self
            .env
            .storage
            .auth_key(dc_id)?
            .ok_or_else(|| InvocationError::Unsupported(format!("auth key exchange (no key for DC{dc_id})")))?;
        let key = AuthKey::from_slice(&key, self.env.crypto.as_ref())
            .ok_or_else(|| InvocationError::Argument(format!("stored auth key for DC{dc_id} is not 256 bytes")))?;
        let option = self.resolve(dc_id).await?;

        let updates = (dc_id == self.primary_dc()).then(|| self.updates.clone());
        let handle = connection::spawn(self.env.clone(), option, key, updates, &self.shutdown);
        conns.insert(dc_id, handle.clone());
        Ok(handle)
    }

    /// Make `dc_id` the account's DC. Connections to the old and new DC are
    /// dropped so the one carrying updates is re-created.
    pub async fn change_primary_dc(&self, dc_id: i32) -> Result<(), InvocationError> {
        let old = self.primary_dc();
        if old == dc_id {
            return Ok(());
        }
        let option = self.resolve(dc_id).await?;
        tracing::info!("[mtlink] primary DC changed: DC{old} -> DC{dc_id}");
        self.primary.store(dc_id, Ordering::Release);
        {
            let mut conns = self.conns.lock().await;
            for id in [old, dc_id] {
                if let Some(h) = conns.remove(&id) {
                    h.stop();
                }
            }
        }
        self.env.storage.set_dcs(&StoredDcs { main: option.clone(), media: option })?;
        Ok(())
    }

    /// Stop every connection.
    pub async fn disconnect_all(&self) {
        for (_, h) in self.conns.lock().await.drain() {
            h.stop();
        }
    }
}

impl RpcSender for DcPool {
    fn send(&self, call: RpcCall) -> BoxFuture<'_, CallResult> {
        Box::pin(async move {
            let abort = call.options.abort.as_ref();
            if abort.is_some_and(|t| t.is_cancelled()) {
                return Err(InvocationError::Cancelled);
            }
            let dc = call.options.dc_id.unwrap_or_else(|| self.primary_dc());
            let conn = self.connection(dc).await?;
            conn.invoke(call.body, call.options.chain_id.as_deref(), call.options.timeout, abort).await
        })
    }
}

// ─── Migration ────────────────────────────────────────────────────────────────

/// Follows `*_MIGRATE_X` redirects, resending the call once.
///
/// Account-level redirects (`PHONE_`, `NETWORK_`, `USER_MIGRATE`) move the
/// primary DC unless the call targets a DC of its own or asks for
/// [`local_migrate`](crate::CallOptions::local_migrate). `FILE_` and
/// `STATS_MIGRATE` only resend that call to the named DC.
pub struct Migration {
    pool: Arc<DcPool>,
}

impl Migration {
    pub fn new(pool: Arc<DcPool>) -> Self { Self { pool } }
}

impl Middleware for Migration {
    fn handle<'a>(&'a self, call: RpcCall, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            let first = next.run(call.clone()).await;
            let Err(InvocationError::Rpc(err)) = &first else { return first };
            let Some(target) = err.value.map(|v| v as i32) else { return first };

            let mut call = call;
            if err.is("PHONE_MIGRATE") || err.is("NETWORK_MIGRATE") || err.is("USER_MIGRATE") {
                if call.options.dc_id.is_none() && !call.options.local_migrate {
                    self.pool.change_primary_dc(target).await?;
                } else {
                    call.options.dc_id = Some(target);
                }
            } else if err.is("FILE_MIGRATE") || err.is("STATS_MIGRATE") {
                call.options.dc_id = Some(target);
            } else {
                return first;
            }
            tracing::debug!("[mtlink] {} -> resending on DC{target}", err.message());
            next.run(call).await
        })
    }
}
