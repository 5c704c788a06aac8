//! Capability seams injected at construction.
//!
//! The emitter consumes everything it needs from the outside world
//! through these two traits: a byte sink for the MIDI stream and a hook
//! pair for fault reporting and self-test acknowledgement. No globals,
//! no registration; contexts built over different sinks are independent.

use crate::error::Fault;

/// Where emitted MIDI bytes go.
///
/// `flush` marks a gesture boundary for the transport; a sink that does
/// not buffer can ignore it.
pub trait MidiSink {
    fn put(&mut self, byte: u8);

    fn flush(&mut self) {}
}

/// Collecting sink, used by tests and offline rendering.
impl MidiSink for Vec<u8> {
    #[inline]
    fn put(&mut self, byte: u8) {
        self.push(byte);
    }
}

/// Out-of-band signals from the emitter.
pub trait EmitterHooks {
    /// A protocol or invariant violation. Must be side-effect-observable;
    /// tests assert on the faults a sequence of calls produces.
    fn fail(&mut self, fault: Fault);

    /// The all-fingers-up self-test found a consistent machine.
    fn passed(&mut self) {}
}

/// Hooks that record everything they see.
#[derive(Debug, Default, Clone)]
pub struct RecordingHooks {
    pub faults: Vec<Fault>,
    pub passes: usize,
}

impl EmitterHooks for RecordingHooks {
    fn fail(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    fn passed(&mut self) {
        self.passes += 1;
    }
}
