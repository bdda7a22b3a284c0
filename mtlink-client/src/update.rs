//! Update containers as the reconciler sees them.
//!
//! The TL schema of updates lives outside this crate. An [`UpdatesSource`]
//! classifies raw `Updates` bodies into the handful of shapes that matter
//! for ordering ([`Updates`], [`RawUpdate`], [`Sequencing`]) and performs
//! the difference calls used to fill gaps. Update bodies themselves are
//! carried through untouched.

use crate::errors::InvocationError;
use crate::pipeline::{BoxFuture, Pipeline};
use crate::pts::UpdatesState;

/// How an update is ordered relative to the others.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sequencing {
    /// Advances the global pts, or a channel's pts, by `pts_count`.
    Pts { channel_id: Option<i64>, pts: i32, pts_count: i32 },
    /// Advances qts by one.
    Qts { qts: i32 },
    /// Carries no counter.
    Unordered,
    /// `updateChannelTooLong`: the channel must be caught up with a
    /// difference. Never delivered.
    ChannelTooLong { channel_id: i64, pts: Option<i32> },
    /// `updatePtsChanged`: the server reset pts. Never delivered.
    PtsChanged,
}

/// One update: its serialized body and how it is ordered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawUpdate {
    pub body: Vec<u8>,
    pub kind: Sequencing,
}

impl RawUpdate {
    pub fn new(body: Vec<u8>, kind: Sequencing) -> Self { Self { body, kind } }

    pub fn unordered(body: Vec<u8>) -> Self { Self { body, kind: Sequencing::Unordered } }

    /// The channel whose pts this update moves, if any.
    pub fn channel_id(&self) -> Option<i64> {
        match self.kind {
            Sequencing::Pts { channel_id, .. } => channel_id,
            Sequencing::ChannelTooLong { channel_id, .. } => Some(channel_id),
            _ => None,
        }
    }

    /// Whether this update is consumed internally instead of delivered.
    pub fn is_internal(&self) -> bool {
        matches!(self.kind, Sequencing::ChannelTooLong { .. } | Sequencing::PtsChanged)
    }
}

/// A decoded `Updates` push.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Updates {
    /// `updatesTooLong`: too much happened, fetch a difference.
    TooLong,
    /// `updateShort` and the short message forms.
    Short(RawUpdate),
    /// `updates` / `updatesCombined`. `seq_start == 0` means the container
    /// is not seq-ordered.
    Batch { updates: Vec<RawUpdate>, seq_start: i32, seq: i32, date: i32 },
}

/// Answer of `updates.getDifference`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Difference {
    Empty { date: i32, seq: i32 },
    /// The gap cannot be filled; jump to `pts`.
    TooLong { pts: i32 },
    /// `updates.difference` (`is_final`) or `updates.differenceSlice`, in
    /// which case `state` is the intermediate state.
    Difference { new_messages: Vec<RawUpdate>, other_updates: Vec<RawUpdate>, state: UpdatesState, is_final: bool },
}

/// Answer of `updates.getChannelDifference`. `timeout` is the server's
/// suggested polling delay in seconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelDifference {
    Empty { pts: i32, timeout: Option<i32> },
    /// Too much happened; the channel restarts at the dialog's pts and only
    /// its recent messages are known.
    TooLong { dialog_pts: Option<i32>, messages: Vec<RawUpdate>, timeout: Option<i32> },
    Difference {
        pts: i32,
        is_final: bool,
        timeout: Option<i32>,
        new_messages: Vec<RawUpdate>,
        other_updates: Vec<RawUpdate>,
    },
}

/// Knows the update part of the schema.
pub trait UpdatesSource: Send + Sync {
    /// Classify a raw `Updates` body pushed by the server.
    fn decode(&self, body: &[u8]) -> Result<Updates, InvocationError>;

    /// `updates.getState`.
    fn get_state<'a>(&'a self, pipeline: &'a Pipeline) -> BoxFuture<'a, Result<UpdatesState, InvocationError>>;

    /// `updates.getDifference` from `state`.
    fn get_difference<'a>(
        &'a self,
        pipeline: &'a Pipeline,
        state: UpdatesState,
    ) -> BoxFuture<'a, Result<Difference, InvocationError>>;

    /// `updates.getChannelDifference` for `channel_id` from `pts`.
    fn get_channel_difference<'a>(
        &'a self,
        pipeline: &'a Pipeline,
        channel_id: i64,
        pts: i32,
        limit: i32,
    ) -> BoxFuture<'a, Result<ChannelDifference, InvocationError>>;
}
