//! Polyphonic pitch gestures in, conforming MIDI bytes out.
//!
//! The [`Emitter`] turns finger gestures carrying fractional pitches into
//! a MIDI stream for a multi-timbral synth. Pitch bend is a per-channel
//! property in MIDI, so the emitter cycles notes across a configured
//! channel span, rewrites a note when its bend would escape the bend-range
//! window, and marks rewrites with a private note-tie NRPN so the synth
//! can splice them back into one continuous gesture.
//!
//! The [`Decoder`] is the inverse machine: it feeds on the same byte
//! stream and delivers per-channel pitch/volume/expression events to an
//! engine callback.
//!
//! ```ignore
//! let mut midi = Emitter::new(Vec::new(), RecordingHooks::default());
//! midi.set_channel_span(8);
//! midi.boot();
//!
//! midi.begin_down(0);
//! midi.end_down(0, 60.0, 0, 0.9, Legato::Off);
//! midi.move_finger(0, 60.37, 0.9, None);
//! midi.up(0, Legato::Off);
//! midi.flush();
//! ```
//!
//! A context is single-threaded and synchronous; independent contexts are
//! fully isolated.

pub mod decoder;
pub mod emitter;
pub mod error;
pub mod sink;

pub use decoder::{Decoder, VoiceEvent};
pub use emitter::{Emitter, Legato, FINGER_MAX, POLY_MAX};
pub use error::Fault;
pub use sink::{EmitterHooks, MidiSink, RecordingHooks};

pub use glissade_wire::{pitch, wire, BEND_CENTER, CHANNEL_MAX, NOTE_MAX};
