//! Update sequence counters and gap classification.
//!
//! The server numbers every update that changes persistent state. Each
//! update carries the counter value it *expects* the client to be at
//! (`pts - pts_count` for pts, `qts - 1` for qts) and the value after it is
//! applied. Comparing the expectation with the local counter tells whether
//! the update is next in line, already seen, or whether some updates were
//! missed and have to be fetched with a difference call.

/// Global update state of an account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UpdatesState {
    /// Main sequence counter (messages, private chats and groups).
    pub pts: i32,
    /// Counter for secret chats and bot-specific updates.
    pub qts: i32,
    /// Date of the last known update (unix seconds).
    pub date: i32,
    /// Sequence number of `updates`/`updatesCombined` containers.
    pub seq: i32,
}

/// A counter can only go up, or drop by a huge amount when the server resets
/// it. Differences larger than this are treated as such a drop.
pub const PTS_DROP_THRESHOLD: i32 = 1_000_009;

/// Gaps smaller than this may be filled by updates still in flight, so the
/// update waits a little before a difference is requested.
pub const SMALL_GAP: i32 = 3;

/// Gaps this large are not worth recovering; the state is fetched anew.
pub const HUGE_GAP: i32 = 1_000_000;

/// How an update relates to the local counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GapCheck {
    /// The update is next in line.
    Apply,
    /// The counter dropped on the server side; apply and follow it.
    Drop,
    /// Already applied; discard.
    Duplicate,
    /// A few updates are missing; wait for them briefly.
    Postpone,
    /// Updates are missing; fetch a difference.
    Gap,
    /// The counter is hopelessly behind; reset it.
    TooLarge,
}

/// Compare the local counter with the value an update expects.
pub fn check_gap(local: i32, before: i32) -> GapCheck {
    let diff = local.wrapping_sub(before);
    if diff > PTS_DROP_THRESHOLD {
        return GapCheck::Drop;
    }
    if diff > 0 {
        return GapCheck::Duplicate;
    }
    if diff < 0 {
        return if diff > -SMALL_GAP {
            GapCheck::Postpone
        } else if diff > -HUGE_GAP {
            GapCheck::Gap
        } else {
            GapCheck::TooLarge
        };
    }
    GapCheck::Apply
}

/// How a seq-numbered container relates to the local `seq`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqCheck {
    Apply,
    /// Already applied; the whole container is ignored.
    Duplicate,
    /// Containers were missed; its updates are still processed, but a
    /// difference must be fetched.
    Gap,
}

pub fn check_seq(local_seq: i32, seq_start: i32) -> SeqCheck {
    let next = local_seq + 1;
    if next > seq_start {
        SeqCheck::Duplicate
    } else if next < seq_start {
        SeqCheck::Gap
    } else {
        SeqCheck::Apply
    }
}
