//! The inverse machine: MIDI bytes in, voice events out.
//!
//! One note per channel is assumed, since the emitter spreads notes
//! across its channel span anyway; that keeps the per-channel state to a
//! (note, volume, bend) triple. Events reach the engine through the
//! callback handed to [`Decoder::new`]. All state lives in the decoder
//! value, so independent streams decode through independent instances.

use glissade_wire::pitch::{self, BEND_CENTER};
use glissade_wire::wire;
use glissade_wire::CHANNEL_MAX;
use tracing::debug;

/// What a synth voice needs to know after one decoded message.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoiceEvent {
    pub channel: u8,
    /// True only for the note-tie signal: the next on/off pair on this
    /// channel is one continuous gesture.
    pub attack: bool,
    /// Reconstructed pitch in semitone units (note + bend deflection).
    pub pitch: f32,
    /// 0.0 for note-off, `velocity / 127` otherwise.
    pub volume: f32,
    /// Sticky expression controller number (11 once seen, else 0).
    pub expr_parm: u8,
    pub expr: u8,
}

/// Which byte the machine expects next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Expect {
    Status,
    NoteOnNote,
    NoteOnVol,
    NoteOffNote,
    NoteOffVol,
    BendLo,
    BendHi,
    CcSelector,
    NrpnKeyMsb,
    NrpnKeyLsb,
    RpnKeyMsb,
    RpnKeyLsb,
    DataValue,
    Expression,
    ChannelPressure,
}

/// Byte-fed MIDI decoder delivering [`VoiceEvent`]s to an engine callback.
pub struct Decoder<F: FnMut(VoiceEvent)> {
    engine: F,
    expect: Expect,
    channel: usize,
    note: [u8; CHANNEL_MAX],
    vol: [u8; CHANNEL_MAX],
    bend: [i32; CHANNEL_MAX],
    /// Bend range in semitones, updated by the bend-range RPN.
    bend_semis: u8,
    nrpn_msb: u8,
    nrpn_lsb: u8,
    rpn_msb: u8,
    rpn_lsb: u8,
    /// Disambiguates whose key a data-entry value belongs to.
    registered: bool,
    expr_parm: u8,
    expr: u8,
}

impl<F: FnMut(VoiceEvent)> Decoder<F> {
    pub fn new(engine: F) -> Self {
        Decoder {
            engine,
            expect: Expect::Status,
            channel: 0,
            note: [0; CHANNEL_MAX],
            vol: [0; CHANNEL_MAX],
            bend: [BEND_CENTER; CHANNEL_MAX],
            bend_semis: 2,
            nrpn_msb: 0,
            nrpn_lsb: 0,
            rpn_msb: 0,
            rpn_lsb: 0,
            registered: false,
            expr_parm: 0,
            expr: 0,
        }
    }

    /// The bend range currently in force, as decoded from the stream.
    pub fn bend_semis(&self) -> u8 {
        self.bend_semis
    }

    /// Feed one byte. Zero or one engine callback per call.
    pub fn put_byte(&mut self, byte: u8) {
        if self.expect == Expect::Status {
            self.bend = [BEND_CENTER; CHANNEL_MAX];
        }

        if byte & 0x80 != 0 {
            let status = (byte >> 4) & 0x0F;
            self.channel = (byte & 0x0F) as usize;
            self.expect = match status {
                0x08 => Expect::NoteOffNote,
                0x09 => Expect::NoteOnNote,
                0x0B => Expect::CcSelector,
                0x0D => Expect::ChannelPressure,
                0x0E => Expect::BendLo,
                _ => {
                    debug!(status, "ignoring unrecognized status byte");
                    self.expect
                }
            };
            return;
        }

        let data = byte & 0x7F;
        match self.expect {
            Expect::NoteOnNote => {
                self.note[self.channel] = data;
                self.expect = Expect::NoteOnVol;
            }
            Expect::NoteOnVol => {
                self.vol[self.channel] = data;
                self.expect = Expect::NoteOnNote;
                self.deliver(self.pitch(), self.volume());
            }
            Expect::NoteOffNote => {
                self.note[self.channel] = data;
                self.expect = Expect::NoteOffVol;
            }
            Expect::NoteOffVol => {
                self.vol[self.channel] = 0;
                self.expect = Expect::NoteOffNote;
                self.deliver(self.pitch(), 0.0);
            }
            Expect::BendLo => {
                self.bend[self.channel] = data as i32;
                self.expect = Expect::BendHi;
            }
            Expect::BendHi => {
                self.bend[self.channel] |= (data as i32) << 7;
                self.expect = Expect::BendLo;
                self.deliver(self.pitch(), self.volume());
            }
            Expect::CcSelector => {
                self.expect = match data {
                    wire::CC_NRPN_MSB => Expect::NrpnKeyMsb,
                    wire::CC_NRPN_LSB => Expect::NrpnKeyLsb,
                    wire::CC_RPN_MSB => Expect::RpnKeyMsb,
                    wire::CC_RPN_LSB => Expect::RpnKeyLsb,
                    wire::CC_DATA_ENTRY => Expect::DataValue,
                    wire::CC_EXPRESSION => Expect::Expression,
                    // Unhandled controller: the next data byte reads as a
                    // selector again; a fresh status byte resets anyway
                    _ => Expect::CcSelector,
                };
            }
            Expect::NrpnKeyMsb => {
                self.registered = false;
                self.nrpn_msb = data;
            }
            Expect::NrpnKeyLsb => {
                self.registered = false;
                self.nrpn_lsb = data;
            }
            Expect::RpnKeyMsb => {
                self.registered = true;
                self.rpn_msb = data;
            }
            Expect::RpnKeyLsb => {
                self.registered = true;
                self.rpn_lsb = data;
            }
            Expect::DataValue => {
                if self.registered && self.rpn_msb == 0 && self.rpn_lsb == 0 {
                    self.bend_semis = data;
                } else if !self.registered && self.nrpn_msb == 9 && self.nrpn_lsb == 71 {
                    // Note-tie: tell the engine the next on/off pair on
                    // this channel belongs to one gesture
                    (self.engine)(VoiceEvent {
                        channel: self.channel as u8,
                        attack: true,
                        pitch: 0.0,
                        volume: 0.0,
                        expr_parm: 0,
                        expr: 0,
                    });
                }
            }
            Expect::Expression => {
                self.expr_parm = wire::CC_EXPRESSION;
                self.expr = data;
            }
            Expect::ChannelPressure => {
                if self.vol[self.channel] != 0 {
                    self.vol[self.channel] = data;
                    self.deliver(self.pitch(), self.volume());
                }
            }
            Expect::Status => {
                debug!(data, "data byte before any status byte");
            }
        }
    }

    /// Gesture boundary. Nothing is buffered, so nothing to do.
    pub fn flush(&mut self) {}

    fn pitch(&self) -> f32 {
        pitch::reconstruct_pitch(self.note[self.channel], self.bend[self.channel], self.bend_semis)
    }

    fn volume(&self) -> f32 {
        self.vol[self.channel] as f32 / 127.0
    }

    fn deliver(&mut self, pitch: f32, volume: f32) {
        let event = VoiceEvent {
            channel: self.channel as u8,
            attack: false,
            pitch,
            volume,
            expr_parm: self.expr_parm,
            expr: self.expr,
        };
        (self.engine)(event);
    }
}
