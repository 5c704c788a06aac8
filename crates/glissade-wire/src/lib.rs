//! MIDI wire vocabulary shared by the glissade emitter and decoder.
//!
//! Pure constants and arithmetic, no I/O. The emitter (`glissade-midi`)
//! writes these byte layouts through an injected sink; the decoder reads
//! them back. Keeping the vocabulary in one crate guarantees the two
//! state machines agree on the bend-range semantics.

pub mod pitch;
pub mod wire;

pub use pitch::BEND_CENTER;
pub use wire::{CHANNEL_MAX, NOTE_MAX};
