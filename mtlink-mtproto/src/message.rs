//! Message identifiers and outgoing message framing.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch according to the local clock.
pub fn unix_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Allocates client message ids.
///
/// An id is `(server_time_secs << 32) | (millis << 21) | (random << 3) | 4`:
/// roughly the server's clock, divisible by four, and strictly increasing
/// even if the local clock jumps backwards.
#[derive(Clone, Debug, Default)]
pub struct MsgIdGenerator {
    last: i64,
    time_offset: i32,
}

impl MsgIdGenerator {
    pub fn new() -> Self { Self::default() }

    /// Seconds to add to the local clock to get the server's.
    pub fn time_offset(&self) -> i32 { self.time_offset }

    pub fn set_time_offset(&mut self, offset: i32) { self.time_offset = offset; }

    /// Re-synchronise with the server using the high half of one of its ids.
    pub fn sync_with_server(&mut self, server_msg_id: i64, local_now_ms: i64) {
        let server_secs = server_msg_id >> 32;
        self.time_offset = (server_secs - local_now_ms / 1000) as i32;
        log::debug!("time offset adjusted to {}s", self.time_offset);
    }

    /// The next id for a message created at `now_ms` (local clock).
    pub fn next(&mut self, now_ms: i64, random: u16) -> i64 {
        let secs = now_ms.div_euclid(1000) + self.time_offset as i64;
        let millis = now_ms.rem_euclid(1000);
        let mut id = (secs << 32) | (millis << 21) | ((random as i64) << 3) | 4;
        if id <= self.last {
            id = self.last + 4;
        }
        self.last = id;
        id
    }

    /// Forget the last id. Only used together with a new session id.
    pub fn reset(&mut self) { self.last = 0; }
}

/// A message with its id and seqno assigned, ready to be encrypted or put
/// into a container.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    pub fn is_content_related(&self) -> bool { self.seq_no & 1 == 1 }
}
