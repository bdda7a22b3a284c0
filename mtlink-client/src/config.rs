//! Server configuration cache and DC address resolution.
//!
//! The server publishes its DC topology in `help.getConfig`. Fetching and
//! decoding that call is the job of a [`ConfigSource`]; [`ConfigManager`]
//! caches the result, refreshes it when it expires and picks the address to
//! dial for a DC.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::InvocationError;
use crate::pipeline::BoxFuture;

// ─── DcOption ─────────────────────────────────────────────────────────────────

/// One address of one DC.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DcOption {
    pub id: i32,
    pub ip_address: String,
    pub port: u16,
    pub ipv6: bool,
    pub media_only: bool,
    /// Only reachable through the obfuscated transport.
    pub tcpo_only: bool,
    pub cdn: bool,
    pub test_mode: bool,
}

impl DcOption {
    pub fn new(id: i32, ip_address: impl Into<String>, port: u16) -> Self {
        Self { id, ip_address: ip_address.into(), port, ..Default::default() }
    }

    /// `host:port`, with IPv6 hosts in brackets.
    pub fn addr(&self) -> String {
        if self.ipv6 {
            format!("[{}]:{}", self.ip_address, self.port)
        } else {
            format!("{}:{}", self.ip_address, self.port)
        }
    }
}

/// Bootstrap table of the production DCs, used until a real config arrives.
pub fn default_dc_options() -> Vec<DcOption> {
    [
        (1, "149.154.175.53"),
        (2, "149.154.167.51"),
        (3, "149.154.175.100"),
        (4, "149.154.167.91"),
        (5, "91.108.56.130"),
    ]
    .into_iter()
    .map(|(id, ip)| DcOption::new(id, ip, 443))
    .collect()
}

// ─── ServerConfig ─────────────────────────────────────────────────────────────

/// The parts of the server config the client cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerConfig {
    /// Unix time (seconds) after which the config must be fetched again.
    pub expires: i64,
    pub dc_options: Vec<DcOption>,
}

/// Where the config comes from, usually a `help.getConfig` call.
pub trait ConfigSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<ServerConfig, InvocationError>>;
}

/// A config that never changes.
pub struct StaticConfig(pub ServerConfig);

impl StaticConfig {
    /// The bootstrap DC table, valid for a day at a time.
    pub fn production() -> Self {
        Self(ServerConfig { expires: 0, dc_options: default_dc_options() })
    }
}

impl ConfigSource for StaticConfig {
    fn fetch(&self) -> BoxFuture<'_, Result<ServerConfig, InvocationError>> {
        let mut config = self.0.clone();
        if config.expires == 0 {
            config.expires = unix_now() + 86_400;
        }
        Box::pin(async move { Ok(config) })
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

// ─── FindOption ───────────────────────────────────────────────────────────────

/// Constraints for [`ConfigManager::find_option`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FindOption {
    pub dc_id: i32,
    pub allow_ipv6: bool,
    pub prefer_ipv6: bool,
    pub allow_media: bool,
    pub prefer_media: bool,
}

/// Pick the best address for `params` out of `options`.
///
/// Obfuscation-only and CDN addresses are never picked.
pub fn find_option<'a>(options: &'a [DcOption], params: &FindOption) -> Option<&'a DcOption> {
    let candidates: Vec<&DcOption> = options
        .iter()
        .filter(|o| !o.tcpo_only && !o.cdn)
        .filter(|o| params.allow_ipv6 || !o.ipv6)
        .filter(|o| params.allow_media || !o.media_only)
        .filter(|o| o.id == params.dc_id)
        .collect();

    let first = |pred: &dyn Fn(&DcOption) -> bool| candidates.iter().copied().find(|o| pred(o));
    match (params.prefer_ipv6, params.prefer_media) {
        (true, true) => first(&|o| o.media_only && o.ipv6)
            .or_else(|| first(&|o| o.media_only))
            .or_else(|| first(&|o| o.ipv6)),
        (true, false) => first(&|o| o.ipv6),
        (false, true) => first(&|o| o.media_only),
        (false, false) => None,
    }
    .or_else(|| candidates.first().copied())
}

// ─── ConfigManager ────────────────────────────────────────────────────────────

struct State {
    config: Option<ServerConfig>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    destroyed: bool,
}

/// Caches the server config and keeps it fresh.
pub struct ConfigManager {
    source: Arc<dyn ConfigSource>,
    state: Mutex<State>,
    refresh: tokio::sync::Mutex<()>,
    tx: watch::Sender<Option<ServerConfig>>,
}

impl ConfigManager {
    pub fn new(source: Arc<dyn ConfigSource>) -> Arc<Self> {
        let (tx, _) = watch::channel(None);
        Arc::new(Self {
            source,
            state: Mutex::new(State { config: None, generation: 0, timer: None, destroyed: false }),
            refresh: tokio::sync::Mutex::new(()),
            tx,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Whether there is no config, or it has expired.
    pub fn is_stale(&self) -> bool {
        match &self.lock().config {
            Some(c) => c.expires <= unix_now(),
            None => true,
        }
    }

    /// The cached config, without fetching.
    pub fn get_now(&self) -> Option<ServerConfig> { self.lock().config.clone() }

    /// The cached config, fetched first if stale.
    pub async fn get(self: &Arc<Self>) -> Result<ServerConfig, InvocationError> {
        if self.is_stale() {
            self.update(false).await?;
        }
        self.get_now().ok_or_else(|| InvocationError::Unsupported("no server config available".into()))
    }

    /// Fetch the config if it is stale (or always, with `force`).
    ///
    /// Concurrent calls share a single fetch.
    pub async fn update(self: &Arc<Self>, force: bool) -> Result<(), InvocationError> {
        let seen = self.lock().generation;
        let _guard = self.refresh.lock().await;
        if self.lock().generation != seen {
            return Ok(());
        }
        if !force && !self.is_stale() {
            return Ok(());
        }

        let config = self.source.fetch().await?;
        tracing::debug!("[mtlink] config reloaded ({} DC options, expires {})", config.dc_options.len(), config.expires);
        self.set_data(config);
        Ok(())
    }

    /// Replace the cached config, notify subscribers and re-arm the refresh
    /// timer.
    pub fn set_data(self: &Arc<Self>, config: ServerConfig) {
        let delay = (config.expires - unix_now()).max(0) as u64;
        let mut st = self.lock();
        st.generation += 1;
        st.config = Some(config.clone());
        if let Some(t) = st.timer.take() {
            t.abort();
        }
        if !st.destroyed {
            let weak = Arc::downgrade(self);
            st.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                if let Some(this) = weak.upgrade() {
                    if let Err(e) = this.update(true).await {
                        tracing::warn!("[mtlink] scheduled config refresh failed: {e}");
                    }
                }
            }));
        }
        drop(st);
        self.tx.send_replace(Some(config));
    }

    /// Receive every reloaded config.
    pub fn subscribe(&self) -> watch::Receiver<Option<ServerConfig>> { self.tx.subscribe() }

    /// Stop refreshing in the background.
    pub fn destroy(&self) {
        let mut st = self.lock();
        st.destroyed = true;
        if let Some(t) = st.timer.take() {
            t.abort();
        }
    }

    /// Resolve the address to dial for a DC.
    pub async fn find_option(self: &Arc<Self>, params: FindOption) -> Result<Option<DcOption>, InvocationError> {
        let config = self.get().await?;
        Ok(find_option(&config.dc_options, &params).cloned())
    }
}

impl Drop for ConfigManager {
    fn drop(&mut self) {
        if let Some(t) = self.lock().timer.take() {
            t.abort();
        }
    }
}
