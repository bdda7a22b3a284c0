//! Server salt rotation.
//!
//! The server announces upcoming salts ahead of time (`future_salts`). The
//! manager keeps exactly one current salt and a queue of future ones ordered
//! by `valid_since`, promoting the head of the queue when its window opens.
//! Promotions are driven through the owner's [`Scheduler`]; installing a new
//! list always cancels and replaces the pending promotion.

use std::collections::VecDeque;

use mtlink_tl_types::mtproto::types::FutureSalt;

use crate::scheduler::{Scheduler, TimerId};

/// A salt and the window (unix seconds) it is accepted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Salt {
    pub value: i64,
    pub valid_since: i64,
    pub valid_until: i64,
}

impl From<&FutureSalt> for Salt {
    fn from(s: &FutureSalt) -> Self {
        Self { value: s.salt, valid_since: s.valid_since as i64, valid_until: s.valid_until as i64 }
    }
}

/// The scheduler action the manager registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaltTimer;

#[derive(Debug, Default)]
pub struct ServerSaltManager {
    current: Option<Salt>,
    future: VecDeque<Salt>,
    fetching: bool,
    timer: Option<TimerId>,
    time_offset: i64,
}

impl ServerSaltManager {
    pub fn new() -> Self { Self::default() }

    /// The salt to embed in outgoing messages, or `0` before any is known.
    pub fn current_salt(&self) -> i64 {
        self.current.map_or(0, |s| s.value)
    }

    pub fn current(&self) -> Option<Salt> { self.current }

    pub fn future_salts(&self) -> impl Iterator<Item = &Salt> { self.future.iter() }

    /// Adopt a salt the server told us about directly (`bad_server_salt`,
    /// `new_session_created`). Its window is unknown, so it never expires on
    /// its own.
    pub fn set_current(&mut self, value: i64) {
        self.current = Some(Salt { value, valid_since: 0, valid_until: i64::MAX });
    }

    /// Whether a `get_future_salts` request should go out now.
    pub fn should_fetch_salts(&self) -> bool {
        !self.fetching && self.current.is_some() && self.future.len() < 2
    }

    pub fn set_fetching(&mut self, fetching: bool) { self.fetching = fetching; }

    pub fn is_fetching(&self) -> bool { self.fetching }

    /// Seconds between the server clock (salt windows) and the local clock
    /// the scheduler runs on.
    pub fn set_time_offset(&mut self, offset: i32) { self.time_offset = offset as i64; }

    /// Install a freshly announced list and promote what is already valid.
    ///
    /// `now` is local unix time in milliseconds, the clock the scheduler
    /// runs on.
    pub fn set_future_salts<A: From<SaltTimer>>(
        &mut self,
        salts: impl IntoIterator<Item = Salt>,
        now: u64,
        scheduler: &mut Scheduler<A>,
    ) {
        let mut salts: Vec<Salt> = salts.into_iter().collect();
        salts.sort_by_key(|s| s.valid_since);
        self.future = salts.into();
        self.fetching = false;
        self.advance(now, scheduler);
    }

    /// Called when the registered [`SaltTimer`] fires.
    pub fn on_timer<A: From<SaltTimer>>(&mut self, now: u64, scheduler: &mut Scheduler<A>) {
        self.timer = None;
        self.advance(now, scheduler);
    }

    /// Cancel the pending promotion.
    pub fn destroy<A>(&mut self, scheduler: &mut Scheduler<A>) {
        if let Some(id) = self.timer.take() {
            scheduler.cancel(id);
        }
    }

    fn advance<A: From<SaltTimer>>(&mut self, now: u64, scheduler: &mut Scheduler<A>) {
        self.destroy(scheduler);
        let now_secs = (now / 1000) as i64 + self.time_offset;

        while let Some(next) = self.future.front() {
            if next.valid_since > now_secs {
                break;
            }
            self.current = self.future.pop_front();
            log::debug!("promoted server salt {:#x}", self.current_salt());
        }

        if let Some(cur) = self.current {
            if cur.valid_until <= now_secs {
                log::debug!("server salt {:#x} expired", cur.value);
                self.current = None;
            }
        }

        let deadline = match (self.future.front(), self.current) {
            (Some(next), _) => Some(next.valid_since),
            (None, Some(cur)) if cur.valid_until != i64::MAX => Some(cur.valid_until),
            _ => None,
        };
        if let Some(secs) = deadline {
            let local = (secs - self.time_offset).max(0) as u64;
            self.timer = Some(scheduler.schedule(local * 1000, SaltTimer.into()));
        }
    }
}
