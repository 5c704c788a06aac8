//! Integration tests for glissade-midi.
//!
//! End-to-end gesture scenarios over the emitter byte stream, plus the
//! emitter → decoder round trip. Byte expectations are exact; the wire
//! format is a compatibility contract.

use std::cell::RefCell;

use glissade_midi::{Decoder, Emitter, Legato, RecordingHooks, VoiceEvent};

fn booted(base: usize, span: usize) -> Emitter<Vec<u8>, RecordingHooks> {
    let mut em = Emitter::new(Vec::new(), RecordingHooks::default());
    em.set_channel_base(base);
    em.set_channel_span(span);
    em.boot();
    em.sink_mut().clear();
    em
}

fn assert_clean(em: &Emitter<Vec<u8>, RecordingHooks>) {
    assert!(em.hooks().faults.is_empty(), "faults: {:?}", em.hooks().faults);
}

/// Bend-range RPN announcement for one channel.
fn rpn_bytes(channel: u8, semis: u8) -> Vec<u8> {
    let cc = 0xB0 | channel;
    vec![
        cc, 101, 0, cc, 100, 0, cc, 6, semis, cc, 38, 0, cc, 101, 127, cc, 100, 127,
    ]
}

/// Note-tie NRPN triple for one (channel, note).
fn tie_bytes(channel: u8, note: u8) -> Vec<u8> {
    let cc = 0xB0 | channel;
    vec![cc, 0x63, 9, cc, 0x62, 71, cc, 0x06, note]
}

/// Split a stream into messages (channel pressure is 2 bytes, the rest 3).
fn messages(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let len = match bytes[i] & 0xF0 {
            0xC0 | 0xD0 => 2,
            _ => 3,
        };
        out.push(bytes[i..i + len].to_vec());
        i += len;
    }
    out
}

fn feed(bytes: &[u8]) -> Vec<VoiceEvent> {
    let events = RefCell::new(Vec::new());
    let mut decoder = Decoder::new(|e| events.borrow_mut().push(e));
    for &b in bytes {
        decoder.put_byte(b);
    }
    drop(decoder);
    events.into_inner()
}

// ---------------------------------------------------------------------------
// 1. Gesture scenarios over the emitted byte stream
// ---------------------------------------------------------------------------

/// Single note, no bend: boot announcement, note-on, note-off, clean
/// self-test.
#[test]
fn test_single_note_stream() {
    let mut em = Emitter::new(Vec::new(), RecordingHooks::default());
    em.set_channel_base(0);
    em.set_channel_span(2);
    em.boot();

    em.begin_down(0);
    em.end_down(0, 60.0, 0, 1.0, Legato::Off);
    em.up(0, Legato::Off);

    let mut expected = rpn_bytes(0, 2);
    expected.extend(rpn_bytes(1, 2));
    expected.extend([0x90, 0x3C, 0x7F, 0x90, 0x3C, 0x00]);
    assert_eq!(*em.sink(), expected);
    assert_eq!(em.hooks().passes, 1);
    assert_clean(&em);
}

/// A bend inside the window moves the pitch wheel, not the note. The
/// move also refreshes channel pressure before the wheel.
#[test]
fn test_bend_within_window_stream() {
    let mut em = booted(0, 2);
    em.begin_down(0);
    em.end_down(0, 60.0, 0, 1.0, Legato::Off);
    em.move_finger(0, 60.5, 1.0, Some(0));
    em.up(0, Legato::Off);

    // 8192 + 0.5 * 8192 / 2 = 10240 -> lo 0x00, hi 0x50
    assert_eq!(
        *em.sink(),
        vec![
            0x90, 0x3C, 0x7F, // note on 60
            0xD0, 0x7F, // pressure for the moving finger
            0xE0, 0x00, 0x50, // one bend to 10240
            0x90, 0x3C, 0x00, // note off 60
        ]
    );
    assert_eq!(em.hooks().passes, 1);
    assert_clean(&em);
}

/// A move past the bend window retriggers: tie the old note, rewrite it
/// on the next cycled channel, account for both.
#[test]
fn test_retrigger_stream() {
    let mut em = booted(0, 2);
    em.begin_down(0);
    em.end_down(0, 60.0, 0, 1.0, Legato::Off);
    em.move_finger(0, 63.0, 1.0, Some(0));
    em.up(0, Legato::Off);

    let mut expected = tie_bytes(0, 0x3C);
    expected.extend([0x90, 0x3C, 0x00]); // old note off, channel 0
    expected.extend([0x91, 0x3F, 0x7F]); // rewritten on channel 1
    expected.extend([0x91, 0x3F, 0x00]); // final up
    let full: Vec<u8> = [vec![0x90, 0x3C, 0x7F], expected].concat();
    assert_eq!(*em.sink(), full);
    assert_clean(&em);
}

/// Legato stack: the newer finger suppresses the older with a tie; its
/// release ties back and re-sounds the older finger at the newer one's
/// velocity, with a forced bend resend.
#[test]
fn test_legato_stack_stream() {
    let mut em = booted(0, 2);
    em.begin_down(0);
    em.end_down(0, 60.0, 0, 1.0, Legato::Full);
    em.begin_down(1);
    em.end_down(1, 62.0, 0, 1.0, Legato::Full);
    em.up(1, Legato::Full);
    em.up(0, Legato::Full);

    let mut expected = vec![0x90, 0x3C, 0x7F];
    expected.extend(tie_bytes(0, 0x3C));
    expected.extend([0x90, 0x3C, 0x00]); // finger 0 suppressed
    expected.extend([0x91, 0x3E, 0x7F]); // finger 1 takes the lead
    expected.extend(tie_bytes(1, 0x3E));
    expected.extend([0x91, 0x3E, 0x00]); // finger 1 comes up
    expected.extend([0xE0, 0x00, 0x40]); // revealed finger's bend resent
    expected.extend([0x90, 0x3C, 0x7F]); // finger 0 re-sounds
    expected.extend([0x90, 0x3C, 0x00]); // finger 0 comes up
    assert_eq!(*em.sink(), expected);
    assert_eq!(em.hooks().passes, 1);
    assert_clean(&em);
}

/// Booting twice without a gesture in between just re-announces.
#[test]
fn test_boot_is_idempotent() {
    let mut em = Emitter::new(Vec::new(), RecordingHooks::default());
    em.set_channel_span(1);
    em.boot();
    em.boot();
    let announce = rpn_bytes(0, 2);
    assert_eq!(*em.sink(), [announce.clone(), announce].concat());

    em.sink_mut().clear();
    em.begin_down(0);
    em.end_down(0, 60.0, 0, 1.0, Legato::Off);
    em.up(0, Legato::Off);
    assert_eq!(*em.sink(), vec![0x90, 0x3C, 0x7F, 0x90, 0x3C, 0x00]);
    assert_clean(&em);
}

// ---------------------------------------------------------------------------
// 2. Accounting properties
// ---------------------------------------------------------------------------

/// Over an all-fingers-up boundary, note-ons and note-offs balance for
/// every (note, channel), even with same-note collisions on a narrow
/// span and legato stacking.
#[test]
fn test_note_accounting_balances() {
    let mut em = booted(0, 2);
    em.begin_down(0);
    em.end_down(0, 60.0, 0, 1.0, Legato::Full);
    em.begin_down(1);
    em.end_down(1, 60.0, 1, 0.8, Legato::Off); // same note, other channel
    em.begin_down(2);
    em.end_down(2, 60.0, 0, 0.6, Legato::Full); // stacks on finger 0
    em.move_finger(2, 64.5, 0.6, None); // retrigger while stacked
    em.up(1, Legato::Off);
    em.up(2, Legato::Full);
    em.up(0, Legato::Full);

    let mut balance = std::collections::HashMap::new();
    for msg in messages(em.sink()) {
        if msg[0] & 0xF0 == 0x90 {
            let key = (msg[0] & 0x0F, msg[1]);
            *balance.entry(key).or_insert(0i32) += if msg[2] > 0 { 1 } else { -1 };
        }
    }
    for ((channel, note), b) in balance {
        assert_eq!(b, 0, "unbalanced note {note} on channel {channel}");
    }
    assert!(em.hooks().passes >= 1);
    assert_clean(&em);
}

/// Every emitted bend is 14-bit-clean and deduplicated per channel.
#[test]
fn test_bend_values_in_range_and_deduplicated() {
    let mut em = booted(0, 1);
    em.begin_down(0);
    em.end_down(0, 60.0, 0, 1.0, Legato::Off);
    for step in 0..40 {
        let fnote = 60.0 + (step % 8) as f32 * 0.05;
        em.move_finger(0, fnote, 1.0, None);
    }
    em.up(0, Legato::Off);

    let mut seen_bends = Vec::new();
    let mut last = None;
    for msg in messages(em.sink()) {
        if msg[0] & 0xF0 == 0xE0 {
            assert!(msg[1] < 128 && msg[2] < 128);
            let value = ((msg[2] as u16) << 7) | msg[1] as u16;
            assert_ne!(Some(value), last, "bend repeated without a change");
            last = Some(value);
            seen_bends.push(value);
        }
    }
    // 8 distinct positions revisited 5 times produce 8 changes per lap
    assert!(seen_bends.len() < 40);
    assert_clean(&em);
}

// ---------------------------------------------------------------------------
// 3. Decoder and round trip
// ---------------------------------------------------------------------------

/// Note-on then bend decode to the pitches a synth would play.
#[test]
fn test_decoder_note_then_bend() {
    let events = feed(&[0x90, 0x3C, 0x40, 0xE0, 0x00, 0x50]);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].channel, 0);
    assert!(!events[0].attack);
    assert!((events[0].pitch - 60.0).abs() < 1e-6);
    assert!((events[0].volume - 0x40 as f32 / 127.0).abs() < 1e-6);
    assert!((events[1].pitch - (60.0 + 2.0 * (10240.0 - 8192.0) / 8192.0)).abs() < 1e-6);
    assert!((events[1].volume - 0x40 as f32 / 127.0).abs() < 1e-6);
}

/// Feed the decoder everything a single-finger gesture emits (including
/// the boot announcement, which retunes the decoder's bend range) and
/// the reconstructed pitch tracks the requested fnote at every step.
#[test]
fn test_emitter_decoder_round_trip() {
    let mut em = Emitter::new(Vec::new(), RecordingHooks::default());
    em.set_channel_base(0);
    em.set_channel_span(1);
    em.set_bend_semis(4);
    em.boot();

    let events = RefCell::new(Vec::<VoiceEvent>::new());
    let mut decoder = Decoder::new(|e| events.borrow_mut().push(e));
    let mut cursor = 0;
    let tolerance = 4.0 / 8192.0 + f32::EPSILON;

    em.begin_down(0);
    em.end_down(0, 60.0, 0, 0.9, Legato::Off);
    // Glides inside the window, then past it to force a retrigger
    let steps = [60.2f32, 60.45, 59.7, 61.5, 63.9, 66.3, 60.0];
    let mut check = |em: &Emitter<Vec<u8>, RecordingHooks>, fnote: f32| {
        for &b in &em.sink()[cursor..] {
            decoder.put_byte(b);
        }
        cursor = em.sink().len();
        let last = *events.borrow().last().expect("no event decoded");
        assert!(!last.attack);
        assert!(
            (last.pitch - fnote).abs() <= tolerance,
            "decoded {} for requested {}",
            last.pitch,
            fnote
        );
        assert!(last.volume > 0.0);
    };
    check(&em, 60.0);
    for &fnote in &steps {
        em.move_finger(0, fnote, 0.9, None);
        check(&em, fnote);
    }
    em.up(0, Legato::Off);
    // Retriggers empty the finger table mid-glide, so the self-test ran
    // more than once; every run must have passed
    assert!(em.hooks().passes >= 1);
    assert_clean(&em);

    // The retriggers mid-glide announced themselves to the engine too
    drop(check);
    drop(decoder);
    assert!(events.into_inner().iter().any(|e| e.attack));
}

/// The decoder picks up a bend-range change from the stream itself.
#[test]
fn test_decoder_follows_bend_range_rpn() {
    let mut em = booted(0, 1);
    em.set_bend_semis(12);

    let events = RefCell::new(Vec::new());
    let mut decoder = Decoder::new(|e| events.borrow_mut().push(e));
    for &b in em.sink() {
        decoder.put_byte(b);
    }
    assert_eq!(decoder.bend_semis(), 12);

    em.sink_mut().clear();
    em.begin_down(0);
    em.end_down(0, 66.0, 0, 1.0, Legato::Off);
    em.move_finger(0, 69.0, 1.0, None); // +3 semis fits a 12-semi window
    for &b in em.sink() {
        decoder.put_byte(b);
    }
    drop(decoder);
    let events = events.into_inner();
    let last = events.last().unwrap();
    assert!((last.pitch - 69.0).abs() < 12.0 / 8192.0 + f32::EPSILON);
    em.up(0, Legato::Off);
    assert_clean(&em);
}
