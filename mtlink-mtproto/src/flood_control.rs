//! Sliding-log rate limiter for locally initiated traffic.
//!
//! Every `(duration, count)` limit keeps a cursor into the shared event log.
//! The cursor marks the oldest event that can still block that limit; once
//! `count` events sit at or after it, the caller must wait until that event
//! leaves its window.

#[derive(Clone, Copy, Debug)]
struct Limit {
    duration: u64,
    count: usize,
    pos: usize,
}

/// Timestamps are in milliseconds of any monotonic clock.
#[derive(Clone, Debug, Default)]
pub struct FloodControl {
    events: Vec<u64>,
    limits: Vec<Limit>,
    wakeup_at: u64,
}

impl FloodControl {
    pub fn new() -> Self { Self::default() }

    /// Allow at most `count` events in any trailing `duration` window.
    pub fn add_limit(&mut self, duration: u64, count: usize) {
        self.limits.push(Limit { duration, count: count.max(1), pos: 0 });
    }

    /// Earliest time the next event may be emitted.
    pub fn wakeup_at(&self) -> u64 { self.wakeup_at }

    /// Whether an event at `now` respects every limit.
    pub fn is_allowed(&self, now: u64) -> bool { now >= self.wakeup_at }

    /// Record an event. Callers should not emit events before [`wakeup_at`](Self::wakeup_at).
    pub fn add_event(&mut self, now: u64) {
        self.events.push(now);
        self.update(now);
    }

    /// Forget the history but keep the limits.
    pub fn clear_events(&mut self) {
        self.events.clear();
        for limit in &mut self.limits {
            limit.pos = 0;
        }
        self.wakeup_at = 0;
    }

    pub fn len(&self) -> usize { self.events.len() }

    pub fn is_empty(&self) -> bool { self.events.is_empty() }

    fn update(&mut self, now: u64) {
        let len = self.events.len();
        let mut min_pos = len;

        for limit in &mut self.limits {
            // Only the last `count` events can matter.
            if len - limit.pos > limit.count {
                limit.pos = len - limit.count;
            }
            while limit.pos < len && self.events[limit.pos] + limit.duration < now {
                limit.pos += 1;
            }
            if limit.pos + limit.count == len {
                self.wakeup_at = self.wakeup_at.max(self.events[limit.pos] + limit.duration);
            }
            min_pos = min_pos.min(limit.pos);
        }

        if min_pos * 2 > len {
            for limit in &mut self.limits {
                limit.pos -= min_pos;
            }
            self.events.drain(..min_pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_per_minute() {
        let mut fc = FloodControl::new();
        fc.add_limit(60_000, 3);
        fc.add_event(1_000);
        fc.add_event(1_400);
        assert!(fc.is_allowed(1_500));
        fc.add_event(1_900);
        assert!(fc.wakeup_at() >= 61_000);
        assert!(!fc.is_allowed(30_000));
        assert!(fc.is_allowed(61_000));
    }

    #[test]
    fn strictest_limit_wins() {
        let mut fc = FloodControl::new();
        fc.add_limit(1_000, 1);
        fc.add_limit(10_000, 3);
        fc.add_event(0);
        assert_eq!(fc.wakeup_at(), 1_000);
        fc.add_event(1_000);
        assert_eq!(fc.wakeup_at(), 2_000);
        fc.add_event(2_000);
        assert_eq!(fc.wakeup_at(), 10_000);
    }

    #[test]
    fn log_stays_bounded() {
        let mut fc = FloodControl::new();
        fc.add_limit(100, 2);
        let mut now = 0;
        for _ in 0..1_000 {
            now = now.max(fc.wakeup_at());
            fc.add_event(now);
        }
        assert!(fc.len() <= 8, "log grew to {}", fc.len());
    }

    #[test]
    fn clear_resets_wakeup() {
        let mut fc = FloodControl::new();
        fc.add_limit(1_000, 1);
        fc.add_event(5);
        assert!(!fc.is_allowed(6));
        fc.clear_events();
        assert!(fc.is_allowed(6));
    }
}
