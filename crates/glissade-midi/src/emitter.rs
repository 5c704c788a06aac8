//! The gesture-to-MIDI state machine.
//!
//! An [`Emitter`] owns a table of finger slots, the MIDI channels it
//! cycles across, and the polyphony groups that give legato its voice
//! stack. All linked structures are index fields over fixed arrays, so
//! every operation is O(1) over a bounded scan and nothing allocates
//! after construction.
//!
//! The hard invariant is note accounting: for every (note, channel)
//! pair, note-ons and note-offs balance out by the time all fingers are
//! up. A self-test verifies this at every all-fingers-up moment and
//! recovers with an all-notes-off sweep plus reboot if a caller bug
//! ever breaks it.

use glissade_wire::pitch::{self, BEND_CENTER};
use glissade_wire::wire;
use glissade_wire::{CHANNEL_MAX, NOTE_MAX};
use tracing::warn;

use crate::error::Fault;
use crate::sink::{EmitterHooks, MidiSink};

/// Finger slots per context. Caller-assigned finger IDs index into this.
pub const FINGER_MAX: usize = 16;

/// Polyphony groups per context.
pub const POLY_MAX: usize = 16;

/// Sentinel that can never equal a real stored bend; forces the next
/// bend emission through the dedup guard.
const BEND_RESEND: i32 = -1;

/// How a transition between notes inside a polyphony group is marked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Legato {
    /// Discrete attacks; no note-ties.
    #[default]
    Off,
    /// Tie the outgoing note when a finger-up reveals a stacked finger.
    Up,
    /// Also tie when a new finger overlaps and suppresses an older one.
    Full,
}

impl Legato {
    #[inline]
    fn ties_on_release(self) -> bool {
        !matches!(self, Legato::Off)
    }

    #[inline]
    fn ties_on_overlap(self) -> bool {
        matches!(self, Legato::Full)
    }
}

#[derive(Clone, Copy, Debug)]
struct FingerState {
    is_on: bool,
    is_suppressed: bool,
    channel: usize,
    note: u8,
    bend: i32,
    velocity: u8,
    poly_group: Option<usize>,
    next_in_poly_group: Option<usize>,
    prev_in_poly_group: Option<usize>,
    next_in_channel: Option<usize>,
    prev_in_channel: Option<usize>,
    visiting_poly_group: Option<usize>,
}

impl FingerState {
    const EMPTY: FingerState = FingerState {
        is_on: false,
        is_suppressed: false,
        channel: 0,
        note: 0,
        bend: BEND_CENTER,
        velocity: 0,
        poly_group: None,
        next_in_poly_group: None,
        prev_in_poly_group: None,
        next_in_channel: None,
        prev_in_channel: None,
        visiting_poly_group: None,
    };

    fn reset(&mut self) {
        *self = FingerState::EMPTY;
    }
}

#[derive(Clone, Copy, Debug)]
struct ChannelState {
    last_bend: i32,
    last_aftertouch: u8,
    current_finger: Option<usize>,
    use_count: i32,
}

impl ChannelState {
    const EMPTY: ChannelState = ChannelState {
        last_bend: BEND_CENTER,
        last_aftertouch: 0,
        current_finger: None,
        use_count: 0,
    };
}

#[derive(Clone, Copy, Debug, Default)]
struct PolyState {
    current_finger: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CtxState {
    Init,
    Booted,
}

/// The emitter context. One per MIDI destination; contexts share nothing.
pub struct Emitter<S: MidiSink, H: EmitterHooks> {
    sink: S,
    hooks: H,
    state: CtxState,
    fingers: [FingerState; FINGER_MAX],
    channels: [ChannelState; CHANNEL_MAX],
    polys: [PolyState; POLY_MAX],
    /// Cycle origin: allocation scans start just after this channel.
    last_allocated_channel: usize,
    fingers_down_count: i32,
    /// Fingers currently holding each (note, channel).
    note_channel_down_count: [[i32; CHANNEL_MAX]; NOTE_MAX],
    /// Note-ons minus note-offs emitted per (note, channel).
    note_channel_down_raw_balance: [[i32; CHANNEL_MAX]; NOTE_MAX],
    channel_base: usize,
    channel_span: usize,
    bend_semis: u8,
    suppress_bends: bool,
}

impl<S: MidiSink, H: EmitterHooks> Emitter<S, H> {
    /// Build an unbooted context over a sink and hooks. Configure it,
    /// then call [`boot`](Self::boot).
    pub fn new(sink: S, hooks: H) -> Self {
        Emitter {
            sink,
            hooks,
            state: CtxState::Init,
            fingers: [FingerState::EMPTY; FINGER_MAX],
            channels: [ChannelState::EMPTY; CHANNEL_MAX],
            polys: [PolyState::default(); POLY_MAX],
            last_allocated_channel: 0,
            fingers_down_count: 0,
            note_channel_down_count: [[0; CHANNEL_MAX]; NOTE_MAX],
            note_channel_down_raw_balance: [[0; CHANNEL_MAX]; NOTE_MAX],
            channel_base: 0,
            channel_span: 8,
            bend_semis: 2,
            suppress_bends: false,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    // ------------------------------------------------------------------
    // Configuration surface
    // ------------------------------------------------------------------

    /// Lowest MIDI channel of the cycling span.
    pub fn set_channel_base(&mut self, base: usize) {
        if base >= CHANNEL_MAX {
            self.hooks.fail(Fault::ChannelBaseOutOfRange(base));
            return;
        }
        self.channel_base = base;
        self.clamp_span();
    }

    pub fn channel_base(&self) -> usize {
        self.channel_base
    }

    /// Number of contiguous channels to cycle across.
    pub fn set_channel_span(&mut self, span: usize) {
        if span < 1 || span > CHANNEL_MAX {
            self.hooks.fail(Fault::ChannelSpanOutOfRange(span));
            return;
        }
        self.channel_span = span;
        self.clamp_span();
    }

    pub fn channel_span(&self) -> usize {
        self.channel_span
    }

    fn clamp_span(&mut self) {
        if self.channel_base + self.channel_span > FINGER_MAX {
            self.channel_span = FINGER_MAX - self.channel_base;
        }
    }

    /// Semitones a full bend spans in each direction. When the context
    /// is already booted, re-announces the range to every channel in
    /// the span via the bend-range RPN.
    pub fn set_bend_semis(&mut self, semis: u8) {
        if !(1..=24).contains(&semis) {
            self.hooks.fail(Fault::BendSemisOutOfRange(semis));
            return;
        }
        self.bend_semis = semis;
        if self.state == CtxState::Booted {
            self.emit_bend_range_rpn();
        }
    }

    pub fn bend_semis(&self) -> u8 {
        self.bend_semis
    }

    pub fn set_suppress_bends(&mut self, suppress: bool) {
        self.suppress_bends = suppress;
    }

    pub fn suppress_bends(&self) -> bool {
        self.suppress_bends
    }

    /// Fingers currently assigned to a channel. UI detail surface.
    pub fn channel_occupancy(&self, channel: usize) -> i32 {
        self.channels.get(channel).map_or(0, |c| c.use_count)
    }

    /// Last bend sent on a channel, normalized to [-1, +1).
    pub fn channel_bend(&self, channel: usize) -> f32 {
        let last = self.channels.get(channel).map_or(BEND_CENTER, |c| c.last_bend);
        (last - BEND_CENTER) as f32 / BEND_CENTER as f32
    }

    /// The poly group a finger last reported passing through during a
    /// move. Metadata only; membership never follows it.
    pub fn visiting_poly_group(&self, finger: usize) -> Option<usize> {
        self.fingers.get(finger).and_then(|f| f.visiting_poly_group)
    }

    // ------------------------------------------------------------------
    // Boot and recovery
    // ------------------------------------------------------------------

    /// Reset every table and announce the bend range. Callable again at
    /// any moment all fingers are known up; configuration, sink and
    /// hooks survive. This is also the recovery path after a failed
    /// self-test.
    pub fn boot(&mut self) {
        for channel in self.channels.iter_mut() {
            *channel = ChannelState::EMPTY;
        }
        for note in 0..NOTE_MAX {
            self.note_channel_down_count[note] = [0; CHANNEL_MAX];
            self.note_channel_down_raw_balance[note] = [0; CHANNEL_MAX];
        }
        for finger in self.fingers.iter_mut() {
            finger.reset();
        }
        for poly in self.polys.iter_mut() {
            poly.current_finger = None;
        }
        self.fingers_down_count = 0;

        // A fault here is a tripwire, not a stop: the clamping setters
        // keep the stored range consistent, and a protocol violation
        // never bricks the context
        if self.channel_span == 0 || self.channel_base + self.channel_span > CHANNEL_MAX {
            self.hooks.fail(Fault::InvalidChannelRange {
                base: self.channel_base,
                span: self.channel_span,
            });
        }
        // Start the cycle so the first allocation lands on the base channel
        self.last_allocated_channel = (self.channel_base + self.channel_span).saturating_sub(1);
        self.state = CtxState::Booted;
        self.emit_bend_range_rpn();
    }

    fn emit_bend_range_rpn(&mut self) {
        let semis = self.bend_semis;
        for s in 0..self.channel_span {
            let channel = self.channel_base + s;
            self.emit_cc(channel, wire::CC_RPN_MSB, 0);
            self.emit_cc(channel, wire::CC_RPN_LSB, 0);
            self.emit_cc(channel, wire::CC_DATA_ENTRY, semis);
            self.emit_cc(channel, wire::CC_DATA_ENTRY_LSB, 0);
            self.emit_cc(channel, wire::CC_RPN_MSB, 127);
            self.emit_cc(channel, wire::CC_RPN_LSB, 127);
        }
    }

    // ------------------------------------------------------------------
    // Gesture operations
    // ------------------------------------------------------------------

    /// A finger has touched down. Claims a channel; the note itself
    /// waits for [`end_down`](Self::end_down) so that expression can be
    /// sandwiched in between.
    pub fn begin_down(&mut self, finger: usize) {
        if !self.check_booted() || !self.check_finger(finger) {
            return;
        }
        if self.fingers[finger].is_on {
            self.hooks.fail(Fault::FingerAlreadyDown(finger));
            return;
        }
        self.fingers[finger].is_on = true;
        let channel = self.alloc_channel(finger);
        self.fingers[finger].channel = channel;
    }

    /// Commit the touch: map the fractional note, join the poly group,
    /// and emit the note-on (plus whatever the group overlap requires).
    pub fn end_down(
        &mut self,
        finger: usize,
        fnote: f32,
        poly_group: usize,
        velocity: f32,
        legato: Legato,
    ) {
        if !self.check_booted() || !self.check_finger(finger) || !self.check_fnote(fnote) {
            return;
        }
        if poly_group >= POLY_MAX {
            self.hooks.fail(Fault::PolyGroupOutOfRange(poly_group));
            return;
        }
        if !self.fingers[finger].is_on {
            self.hooks.fail(Fault::FingerNotDown(finger));
            return;
        }

        // Zero is reserved for note-off, so the stored velocity floors at 1
        let vel = clamp_velocity(velocity);
        let (note, bend) = pitch::note_bend_from_fnote(fnote, self.bend_semis);
        let channel = self.fingers[finger].channel;
        {
            let fs = &mut self.fingers[finger];
            fs.velocity = vel;
            fs.poly_group = Some(poly_group);
            fs.note = note;
            fs.bend = bend;
        }

        self.fingers_down_count += 1;
        self.note_channel_down_count[note as usize][channel] += 1;

        // Pre-clear only when another finger already holds this (note, channel)
        if !self.fingers[finger].is_suppressed
            && self.note_channel_down_count[note as usize][channel] > 1
        {
            self.emit_note(channel, note, 0);
            self.note_channel_down_raw_balance[note as usize][channel] -= 1;
        }

        let finger_turning_off = self.link(finger);
        self.set_current_bend(finger);

        if self.channels[channel].current_finger != Some(finger) {
            self.hooks.fail(Fault::NotChannelLeader(finger));
        }
        if let Some(off) = finger_turning_off {
            let off_state = self.fingers[off];
            if !off_state.is_on {
                self.hooks.fail(Fault::StackedFingerNotDown(off));
            }
            if !off_state.is_suppressed {
                self.hooks.fail(Fault::OverlappedFingerNotSuppressed(off));
            }
            if legato.ties_on_overlap() {
                self.emit_note_tie(off_state.channel, off_state.note);
            }
            self.emit_note(off_state.channel, off_state.note, 0);
            self.note_channel_down_raw_balance[off_state.note as usize][off_state.channel] -= 1;
        }

        self.emit_note(channel, note, vel);
        self.note_channel_down_raw_balance[note as usize][channel] += 1;
        if self.note_channel_down_raw_balance[note as usize][channel] > 1 {
            warn!(channel, note, "doubled note-on while putting a finger down");
        }
    }

    /// The finger came up. Turns its note off, reveals the next finger
    /// stacked in its poly group if any, and releases the channel. Runs
    /// the self-test once no fingers remain.
    pub fn up(&mut self, finger: usize, legato: Legato) {
        if !self.check_booted() || !self.check_finger(finger) {
            return;
        }
        if !self.fingers[finger].is_on {
            self.hooks.fail(Fault::FingerNotDown(finger));
            return;
        }

        let outgoing = self.fingers[finger];
        let promoted = self.unlink(finger);

        let note = outgoing.note as usize;
        let channel = outgoing.channel;
        self.note_channel_down_count[note][channel] -= 1;

        if !outgoing.is_suppressed && self.note_channel_down_count[note][channel] == 0 {
            if promoted.is_some() && legato.ties_on_release() {
                self.emit_note_tie(channel, outgoing.note);
            }
            self.emit_note(channel, outgoing.note, 0);
            self.note_channel_down_raw_balance[note][channel] -= 1;
        }

        if let Some(revealed) = promoted {
            let rs = self.fingers[revealed];
            if !rs.is_on {
                self.hooks.fail(Fault::StackedFingerNotDown(revealed));
            }
            if rs.is_suppressed {
                self.hooks.fail(Fault::PromotedFingerSuppressed(revealed));
            }
            // Ups are rare; always resend the revealed finger's bend
            self.channels[rs.channel].last_bend = BEND_RESEND;
            self.set_current_bend(revealed);
            // The revealed note adopts the outgoing finger's velocity
            self.fingers[revealed].velocity = outgoing.velocity;
            self.emit_note(rs.channel, rs.note, outgoing.velocity);
            self.note_channel_down_raw_balance[rs.note as usize][rs.channel] += 1;
            if self.note_channel_down_raw_balance[rs.note as usize][rs.channel] > 1 {
                warn!(
                    channel = rs.channel,
                    note = rs.note,
                    "doubled note-on while revealing a stacked finger"
                );
            }
        }

        if self.note_channel_down_count[note][channel] < 0 {
            self.hooks.fail(Fault::NegativeNoteCount {
                note: outgoing.note,
                channel,
            });
        }
        self.fingers_down_count -= 1;
        if self.fingers_down_count < 0 {
            self.hooks.fail(Fault::NegativeFingersDown);
        }

        self.fingers[finger].is_on = false;
        self.free_channel(finger);
        self.fingers[finger].reset();

        if self.fingers_down_count <= 0 {
            self.self_test();
        }
    }

    /// Glide a finger. Within the bend window this is a bend (and
    /// aftertouch) update; past it the note is rewritten on a freshly
    /// cycled channel with a note-tie marking the splice. Returns the
    /// input `fnote` unchanged (reserved for a quantization hook).
    pub fn move_finger(
        &mut self,
        finger: usize,
        fnote: f32,
        velocity: f32,
        poly_group: Option<usize>,
    ) -> f32 {
        if !self.check_booted() || !self.check_finger(finger) || !self.check_fnote(fnote) {
            return fnote;
        }
        if !self.fingers[finger].is_on {
            self.hooks.fail(Fault::FingerNotDown(finger));
            return fnote;
        }

        let current_note = self.fingers[finger].note;
        let new_bend = pitch::bend_from_existing_note(fnote, current_note, self.bend_semis);
        let existing_group = self.fingers[finger].poly_group;
        if let Some(group) = poly_group {
            if group < POLY_MAX {
                self.fingers[finger].visiting_poly_group = Some(group);
            }
        }

        if !pitch::escapes_bend_window(new_bend) {
            self.fingers[finger].bend = new_bend;
            self.set_current_aftertouch(finger, velocity);
            self.set_current_bend(finger);
        } else {
            let fs = self.fingers[finger];
            self.emit_note_tie(fs.channel, fs.note);
            self.up(finger, Legato::Up);
            self.begin_down(finger);
            // A finger between begin and end has no group yet; the range
            // fault in end_down reports that caller bug
            self.end_down(
                finger,
                fnote,
                existing_group.unwrap_or(POLY_MAX),
                velocity,
                Legato::Up,
            );
        }
        fnote
    }

    /// Send one controller value for a finger's channel. Callable any
    /// time the finger is down, including between `begin_down` and
    /// `end_down` so the control is in place before the note sounds.
    pub fn express(&mut self, finger: usize, key: u8, value: f32) {
        if !self.check_booted() || !self.check_finger(finger) {
            return;
        }
        if !self.fingers[finger].is_on {
            self.hooks.fail(Fault::FingerNotDown(finger));
            return;
        }
        let channel = self.fingers[finger].channel;
        self.emit_cc(channel, key % 127, ((value * 127.0) as i32 % 127) as u8);
    }

    /// Mark a gesture boundary for the transport.
    pub fn flush(&mut self) {
        self.sink.flush();
    }

    // ------------------------------------------------------------------
    // Channel cycling
    // ------------------------------------------------------------------

    /// Claim the least-loaded channel in the span for a finger, breaking
    /// ties with the channel farthest after the previous allocation so a
    /// just-released channel gets the longest time to finish its release
    /// envelope before reuse.
    fn alloc_channel(&mut self, finger: usize) -> usize {
        let span = self.channel_span;
        let base = self.channel_base;
        for occupancy in 0..=(FINGER_MAX as i32) {
            for s in 0..span {
                let candidate = self.last_allocated_channel as isize + 1 + s as isize;
                let channel =
                    (candidate - base as isize).rem_euclid(span as isize) as usize + base;
                if self.channels[channel].use_count < 0 {
                    self.hooks.fail(Fault::NegativeUseCount(channel));
                    return base;
                }
                if self.channels[channel].use_count == occupancy {
                    self.channels[channel].use_count += 1;
                    if let Some(leader) = self.channels[channel].current_finger {
                        if self.fingers[leader].next_in_channel.is_some() {
                            self.hooks.fail(Fault::ChannelLeaderHasSuccessor(channel));
                        }
                        self.fingers[leader].next_in_channel = Some(finger);
                        self.fingers[finger].prev_in_channel = Some(leader);
                    }
                    self.channels[channel].current_finger = Some(finger);
                    self.last_allocated_channel = channel;
                    return channel;
                }
            }
        }
        self.hooks.fail(Fault::AllocationExhausted);
        base
    }

    /// Give a finger's channel back: drop the use count, splice the
    /// finger out of the channel list, and hand leadership back to the
    /// previous (older) finger if the leader left.
    fn free_channel(&mut self, finger: usize) {
        let channel = self.fingers[finger].channel;
        self.channels[channel].use_count -= 1;
        if self.channels[channel].use_count < 0 {
            self.hooks.fail(Fault::NegativeUseCount(channel));
        }
        let prev = self.fingers[finger].prev_in_channel;
        let next = self.fingers[finger].next_in_channel;
        if let Some(p) = prev {
            self.fingers[p].next_in_channel = next;
        }
        if let Some(n) = next {
            self.fingers[n].prev_in_channel = prev;
        }
        self.fingers[finger].prev_in_channel = None;
        self.fingers[finger].next_in_channel = None;
        if self.channels[channel].current_finger == Some(finger) {
            self.channels[channel].current_finger = prev;
        }
    }

    // ------------------------------------------------------------------
    // Polyphony groups
    // ------------------------------------------------------------------

    /// Push a finger onto its poly group's voice stack. A previous
    /// leader is suppressed (silent but remembered) and returned so the
    /// caller can turn its note off.
    fn link(&mut self, finger: usize) -> Option<usize> {
        let group = self.fingers[finger].poly_group?;
        let displaced = self.polys[group].current_finger;
        if let Some(d) = displaced {
            self.fingers[d].is_suppressed = true;
            self.fingers[d].next_in_poly_group = Some(finger);
            self.fingers[finger].prev_in_poly_group = Some(d);
        }
        self.polys[group].current_finger = Some(finger);
        displaced
    }

    /// Remove a finger from its poly group. If it led the group, the
    /// next-most-recent finger is promoted, un-suppressed, and returned
    /// so the caller can sound it again.
    fn unlink(&mut self, finger: usize) -> Option<usize> {
        let group = self.fingers[finger].poly_group?;
        let leader = self.polys[group].current_finger;
        let prev = self.fingers[finger].prev_in_poly_group;
        let next = self.fingers[finger].next_in_poly_group;
        if let Some(p) = prev {
            self.fingers[p].next_in_poly_group = next;
        }
        if let Some(n) = next {
            self.fingers[n].prev_in_poly_group = prev;
        }
        let mut promoted = None;
        if leader == Some(finger) {
            self.polys[group].current_finger = prev;
            promoted = prev;
            if let Some(p) = promoted {
                self.fingers[p].is_suppressed = false;
            }
        }
        self.fingers[finger].prev_in_poly_group = None;
        self.fingers[finger].next_in_poly_group = None;
        self.fingers[finger].poly_group = None;
        promoted
    }

    // ------------------------------------------------------------------
    // Byte emission
    // ------------------------------------------------------------------

    fn put3(&mut self, status: u8, d1: u8, d2: u8) {
        self.sink.put(status);
        self.sink.put(d1);
        self.sink.put(d2);
    }

    fn emit_note(&mut self, channel: usize, note: u8, velocity: u8) {
        self.put3(wire::NOTE_ON | channel as u8, note, velocity);
    }

    fn emit_cc(&mut self, channel: usize, cc: u8, value: u8) {
        self.put3(wire::CONTROL_CHANGE | channel as u8, cc, value);
    }

    /// Mark the note on a channel as half of one continuous gesture.
    /// No RPN-reset tail: synths interpret it inconsistently.
    fn emit_note_tie(&mut self, channel: usize, note: u8) {
        let (lo, hi) = wire::split_14bit(wire::NOTE_TIE_KEY);
        self.emit_cc(channel, wire::CC_NRPN_MSB, hi);
        self.emit_cc(channel, wire::CC_NRPN_LSB, lo);
        self.emit_cc(channel, wire::CC_DATA_ENTRY, note);
    }

    /// Send a finger's stored bend, deduplicated against the last value
    /// the channel saw. Only the channel leader speaks; this value-change
    /// dedup is the only bend rate limiting.
    fn set_current_bend(&mut self, finger: usize) {
        let fs = self.fingers[finger];
        if self.channels[fs.channel].last_bend != fs.bend
            && self.channels[fs.channel].current_finger == Some(finger)
            && fs.is_on
            && !self.suppress_bends
        {
            self.channels[fs.channel].last_bend = fs.bend;
            let (lo, hi) = wire::split_14bit(fs.bend as u16);
            self.put3(wire::PITCH_BEND | fs.channel as u8, lo, hi);
        }
    }

    /// Update a finger's velocity and send it as channel pressure under
    /// the same guard as bend emission.
    fn set_current_aftertouch(&mut self, finger: usize, velocity: f32) {
        let vel = clamp_velocity(velocity);
        self.fingers[finger].velocity = vel;
        let fs = self.fingers[finger];
        if self.channels[fs.channel].last_aftertouch != vel
            && self.channels[fs.channel].current_finger == Some(finger)
            && fs.is_on
            && !self.suppress_bends
        {
            self.channels[fs.channel].last_aftertouch = vel;
            self.sink.put(wire::CHANNEL_PRESSURE | fs.channel as u8);
            self.sink.put(vel);
        }
    }

    // ------------------------------------------------------------------
    // Self-test and recovery
    // ------------------------------------------------------------------

    /// Verify every all-fingers-up invariant. On success the `passed`
    /// hook fires. On failure: brute-force note-off sweep over every
    /// (note, channel), flush, reboot. Some synths ignore all-notes-off,
    /// so the sweep is per-note.
    fn self_test(&mut self) {
        let mut passed = true;
        if self.fingers_down_count == 0 {
            for c in 0..CHANNEL_MAX {
                let use_count = self.channels[c].use_count;
                if use_count != 0 {
                    self.hooks.fail(Fault::ResidualUseCount {
                        channel: c,
                        count: use_count,
                    });
                    passed = false;
                }
                for n in 0..NOTE_MAX {
                    if self.note_channel_down_count[n][c] != 0 {
                        self.hooks.fail(Fault::ResidualNoteCount {
                            note: n as u8,
                            channel: c,
                            count: self.note_channel_down_count[n][c],
                        });
                        passed = false;
                    }
                    let balance = self.note_channel_down_raw_balance[n][c];
                    if balance < 0 {
                        // An extra note-off is harmless; repair quietly
                        self.note_channel_down_raw_balance[n][c] = 0;
                        warn!(note = n, channel = c, balance, "repaired negative note balance");
                    } else if balance > 0 {
                        self.hooks.fail(Fault::UnbalancedNote {
                            note: n as u8,
                            channel: c,
                            balance,
                        });
                        passed = false;
                    }
                }
                if self.channels[c].current_finger.is_some() {
                    self.hooks.fail(Fault::ResidualChannelLeader(c));
                    passed = false;
                }
            }
            for p in 0..POLY_MAX {
                if self.polys[p].current_finger.is_some() {
                    self.hooks.fail(Fault::ResidualPolyLeader(p));
                    passed = false;
                }
            }
            for f in 0..FINGER_MAX {
                if self.fingers[f].is_on {
                    self.hooks.fail(Fault::ResidualFingerDown(f));
                    passed = false;
                }
                let fs = &self.fingers[f];
                if fs.next_in_channel.is_some()
                    || fs.prev_in_channel.is_some()
                    || fs.next_in_poly_group.is_some()
                    || fs.prev_in_poly_group.is_some()
                {
                    self.hooks.fail(Fault::ResidualFingerLink(f));
                    passed = false;
                }
            }
        }
        if self.fingers_down_count < 0 {
            self.hooks.fail(Fault::NegativeFingersDown);
            passed = false;
        }

        if passed {
            self.hooks.passed();
        } else {
            for n in 0..NOTE_MAX {
                for c in 0..CHANNEL_MAX {
                    self.emit_note(c, n as u8, 0);
                }
                self.flush();
            }
            self.boot();
        }
    }

    // ------------------------------------------------------------------
    // Precondition checks
    // ------------------------------------------------------------------

    fn check_booted(&mut self) -> bool {
        if self.state != CtxState::Booted {
            self.hooks.fail(Fault::NotBooted);
            return false;
        }
        true
    }

    fn check_finger(&mut self, finger: usize) -> bool {
        if finger >= FINGER_MAX {
            self.hooks.fail(Fault::FingerOutOfRange(finger));
            return false;
        }
        true
    }

    fn check_fnote(&mut self, fnote: f32) -> bool {
        if !(-0.5..127.5).contains(&fnote) {
            self.hooks.fail(Fault::FnoteOutOfRange(fnote));
            return false;
        }
        true
    }

    /// Test seam: plant an inconsistency the next self-test must find.
    #[cfg(test)]
    fn corrupt_note_count(&mut self, note: u8, channel: usize, count: i32) {
        self.note_channel_down_count[note as usize][channel] = count;
    }

    /// Test seam: store a channel range the clamping setters would refuse.
    #[cfg(test)]
    fn corrupt_channel_range(&mut self, base: usize, span: usize) {
        self.channel_base = base;
        self.channel_span = span;
    }
}

#[inline]
fn clamp_velocity(velocity: f32) -> u8 {
    ((velocity * 127.0) as i32).clamp(1, 127) as u8
}
