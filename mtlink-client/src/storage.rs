//! Pluggable persistence for everything the client has to remember between
//! runs.
//!
//! [`SessionStorage`] abstracts over where session data lives so that callers
//! can plug in a database, a file, or anything else. [`InMemoryStorage`] is
//! the built-in ephemeral backend.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use mtlink_mtproto::Salt;

use crate::config::DcOption;
use crate::pts::UpdatesState;

/// The DCs the account lives on.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StoredDcs {
    pub main: DcOption,
    /// Where media is served from; usually the same DC as `main`.
    pub media: DcOption,
}

/// Minimal facts about the logged-in account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SelfInfo {
    pub user_id: i64,
    pub is_bot: bool,
}

/// Storage collaborator of the client.
///
/// Calls are synchronous and expected to be cheap; backends that talk to a
/// slow medium should buffer writes.
pub trait SessionStorage: Send + Sync {
    fn auth_key(&self, dc_id: i32) -> io::Result<Option<Vec<u8>>>;

    /// Store or (with `None`) forget the permanent key of a DC.
    fn set_auth_key(&self, dc_id: i32, key: Option<&[u8]>) -> io::Result<()>;

    /// A temporary key for `dc_id` that is still valid at `now` (unix seconds).
    fn temp_auth_key(&self, dc_id: i32, now: i64) -> io::Result<Option<Vec<u8>>>;

    fn set_temp_auth_key(&self, dc_id: i32, key: Option<&[u8]>, expires_at: i64) -> io::Result<()>;

    fn updates_state(&self) -> io::Result<Option<UpdatesState>>;

    fn set_pts(&self, pts: i32) -> io::Result<()>;

    fn set_qts(&self, qts: i32) -> io::Result<()>;

    fn set_date(&self, date: i32) -> io::Result<()>;

    fn set_seq(&self, seq: i32) -> io::Result<()>;

    fn channel_pts(&self, channel_id: i64) -> io::Result<Option<i32>>;

    fn set_channel_pts(&self, channel_id: i64, pts: i32) -> io::Result<()>;

    fn future_salts(&self, dc_id: i32) -> io::Result<Option<Vec<Salt>>>;

    fn set_future_salts(&self, dc_id: i32, salts: &[Salt]) -> io::Result<()>;

    fn dcs(&self) -> io::Result<Option<StoredDcs>>;

    fn set_dcs(&self, dcs: &StoredDcs) -> io::Result<()>;

    fn self_info(&self) -> io::Result<Option<SelfInfo>>;

    fn set_self_info(&self, info: Option<SelfInfo>) -> io::Result<()>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── InMemoryStorage ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Data {
    auth_keys: HashMap<i32, Vec<u8>>,
    temp_keys: HashMap<i32, (Vec<u8>, i64)>,
    pts: Option<i32>,
    qts: Option<i32>,
    date: Option<i32>,
    seq: Option<i32>,
    channel_pts: HashMap<i64, i32>,
    salts: HashMap<i32, Vec<Salt>>,
    dcs: Option<StoredDcs>,
    self_info: Option<SelfInfo>,
}

/// An ephemeral backend that stores nothing on disk.
///
/// Useful for testing, or for short-lived sessions imported from a string.
#[derive(Default)]
pub struct InMemoryStorage {
    data: Mutex<Data>,
}

impl InMemoryStorage {
    pub fn new() -> Self { Self::default() }

    fn with<T>(&self, f: impl FnOnce(&mut Data) -> T) -> io::Result<T> {
        let mut data = self.data.lock().map_err(|_| io::Error::other("storage mutex poisoned"))?;
        Ok(f(&mut data))
    }
}

impl SessionStorage for InMemoryStorage {
    fn auth_key(&self, dc_id: i32) -> io::Result<Option<Vec<u8>>> {
        self.with(|d| d.auth_keys.get(&dc_id).cloned())
    }

    fn set_auth_key(&self, dc_id: i32, key: Option<&[u8]>) -> io::Result<()> {
        self.with(|d| match key {
            Some(k) => {
                d.auth_keys.insert(dc_id, k.to_vec());
            }
            None => {
                d.auth_keys.remove(&dc_id);
            }
        })
    }

    fn temp_auth_key(&self, dc_id: i32, now: i64) -> io::Result<Option<Vec<u8>>> {
        self.with(|d| match d.temp_keys.get(&dc_id) {
            Some((k, expires)) if *expires > now => Some(k.clone()),
            _ => None,
        })
    }

    fn set_temp_auth_key(&self, dc_id: i32, key: Option<&[u8]>, expires_at: i64) -> io::Result<()> {
        self.with(|d| match key {
            Some(k) => {
                d.temp_keys.insert(dc_id, (k.to_vec(), expires_at));
            }
            None => {
                d.temp_keys.remove(&dc_id);
            }
        })
    }

    fn updates_state(&self) -> io::Result<Option<UpdatesState>> {
        self.with(|d| {
            let pts = d.pts?;
            Some(UpdatesState {
                pts,
                qts: d.qts.unwrap_or(0),
                date: d.date.unwrap_or(0),
                seq: d.seq.unwrap_or(0),
            })
        })
    }

    fn set_pts(&self, pts: i32) -> io::Result<()> { self.with(|d| d.pts = Some(pts)) }

    fn set_qts(&self, qts: i32) -> io::Result<()> { self.with(|d| d.qts = Some(qts)) }

    fn set_date(&self, date: i32) -> io::Result<()> { self.with(|d| d.date = Some(date)) }

    fn set_seq(&self, seq: i32) -> io::Result<()> { self.with(|d| d.seq = Some(seq)) }

    fn channel_pts(&self, channel_id: i64) -> io::Result<Option<i32>> {
        self.with(|d| d.channel_pts.get(&channel_id).copied())
    }

    fn set_channel_pts(&self, channel_id: i64, pts: i32) -> io::Result<()> {
        self.with(|d| {
            d.channel_pts.insert(channel_id, pts);
        })
    }

    fn future_salts(&self, dc_id: i32) -> io::Result<Option<Vec<Salt>>> {
        self.with(|d| d.salts.get(&dc_id).cloned())
    }

    fn set_future_salts(&self, dc_id: i32, salts: &[Salt]) -> io::Result<()> {
        self.with(|d| {
            d.salts.insert(dc_id, salts.to_vec());
        })
    }

    fn dcs(&self) -> io::Result<Option<StoredDcs>> { self.with(|d| d.dcs.clone()) }

    fn set_dcs(&self, dcs: &StoredDcs) -> io::Result<()> { self.with(|d| d.dcs = Some(dcs.clone())) }

    fn self_info(&self) -> io::Result<Option<SelfInfo>> { self.with(|d| d.self_info) }

    fn set_self_info(&self, info: Option<SelfInfo>) -> io::Result<()> { self.with(|d| d.self_info = info) }

    fn name(&self) -> &str { "in-memory" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_and_forget() {
        let s = InMemoryStorage::new();
        assert_eq!(s.auth_key(2).unwrap(), None);
        s.set_auth_key(2, Some(&[7u8; 256])).unwrap();
        assert_eq!(s.auth_key(2).unwrap().map(|k| k.len()), Some(256));
        s.set_auth_key(2, None).unwrap();
        assert_eq!(s.auth_key(2).unwrap(), None);
    }

    #[test]
    fn temp_keys_expire() {
        let s = InMemoryStorage::new();
        s.set_temp_auth_key(1, Some(&[1u8; 256]), 1_000).unwrap();
        assert!(s.temp_auth_key(1, 999).unwrap().is_some());
        assert!(s.temp_auth_key(1, 1_000).unwrap().is_none());
    }

    #[test]
    fn updates_state_needs_pts() {
        let s = InMemoryStorage::new();
        s.set_qts(3).unwrap();
        assert_eq!(s.updates_state().unwrap(), None);
        s.set_pts(10).unwrap();
        s.set_date(20).unwrap();
        s.set_seq(4).unwrap();
        assert_eq!(s.updates_state().unwrap(), Some(UpdatesState { pts: 10, qts: 3, date: 20, seq: 4 }));
    }
}
