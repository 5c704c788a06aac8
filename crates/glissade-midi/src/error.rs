//! Typed protocol and invariant violations.

use thiserror::Error;

/// A violation delivered through [`crate::EmitterHooks::fail`].
///
/// Caller-protocol variants mean the offending call was dropped; the
/// context stays alive. Self-test variants mean the context silenced
/// everything and rebooted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Fault {
    #[error("context is not booted yet")]
    NotBooted,

    #[error("finger {0} out of range")]
    FingerOutOfRange(usize),

    #[error("poly group {0} out of range")]
    PolyGroupOutOfRange(usize),

    #[error("fnote {0} outside [-0.5, 127.5)")]
    FnoteOutOfRange(f32),

    #[error("finger {0} is already down")]
    FingerAlreadyDown(usize),

    #[error("finger {0} is not down")]
    FingerNotDown(usize),

    #[error("channel base {0} out of range")]
    ChannelBaseOutOfRange(usize),

    #[error("channel span {0} out of range")]
    ChannelSpanOutOfRange(usize),

    #[error("bend range {0} semitones outside the 1..=24 MIDI limit")]
    BendSemisOutOfRange(u8),

    #[error("channel base {base} + span {span} exceeds the channel count")]
    InvalidChannelRange { base: usize, span: usize },

    #[error("channel {0} use count went negative")]
    NegativeUseCount(usize),

    #[error("no channel satisfied the allocation scan")]
    AllocationExhausted,

    #[error("channel {0} leader already has a successor")]
    ChannelLeaderHasSuccessor(usize),

    #[error("finger {0} should lead its channel after its note-down")]
    NotChannelLeader(usize),

    #[error("stacked finger {0} is not down")]
    StackedFingerNotDown(usize),

    #[error("overlapped finger {0} is not suppressed")]
    OverlappedFingerNotSuppressed(usize),

    #[error("promoted finger {0} is still suppressed")]
    PromotedFingerSuppressed(usize),

    #[error("note {note} channel {channel} down count went negative")]
    NegativeNoteCount { note: u8, channel: usize },

    #[error("fingers-down count went negative")]
    NegativeFingersDown,

    #[error("self-test: channel {channel} use count is {count} with no fingers down")]
    ResidualUseCount { channel: usize, count: i32 },

    #[error("self-test: note {note} channel {channel} down count is {count} with no fingers down")]
    ResidualNoteCount { note: u8, channel: usize, count: i32 },

    #[error("self-test: note {note} channel {channel} on/off balance is {balance}")]
    UnbalancedNote { note: u8, channel: usize, balance: i32 },

    #[error("self-test: channel {0} still has a leader")]
    ResidualChannelLeader(usize),

    #[error("self-test: poly group {0} still has a leader")]
    ResidualPolyLeader(usize),

    #[error("self-test: finger {0} is still down")]
    ResidualFingerDown(usize),

    #[error("self-test: finger {0} is still linked")]
    ResidualFingerLink(usize),
}
