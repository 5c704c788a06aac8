//! Fractional-note to (note, 14-bit bend) mapping.
//!
//! A fractional note `fnote` in `[-0.5, 127.5)` names a pitch in
//! 12-ET semitone units. The wire carries an integer note number plus a
//! per-channel 14-bit bend whose full swing covers `bend_semis`
//! semitones each direction.

use crate::wire::NOTE_MAX;

/// Bend value meaning "no deflection". The 14-bit range is `[0, 16383]`.
pub const BEND_CENTER: i32 = 8192;

/// Map a fractional note to the nearest integer note and the bend that
/// reaches the remainder. The nearest-note policy keeps every fresh bend
/// within half a semitone of center.
#[inline]
pub fn note_bend_from_fnote(fnote: f32, bend_semis: u8) -> (u8, i32) {
    let note = (fnote + 0.5) as i32;
    let bend = bend_for_note(fnote, note, bend_semis);
    (note.clamp(0, NOTE_MAX as i32 - 1) as u8, bend)
}

/// Bend that expresses `fnote` relative to an already-sounding `note`.
/// The result may fall outside `[0, 2 * BEND_CENTER)`; the caller checks
/// [`escapes_bend_window`] to decide whether the note must be rewritten.
#[inline]
pub fn bend_from_existing_note(fnote: f32, note: u8, bend_semis: u8) -> i32 {
    bend_for_note(fnote, note as i32, bend_semis)
}

#[inline]
fn bend_for_note(fnote: f32, note: i32, bend_semis: u8) -> i32 {
    let frac = fnote - note as f32;
    (BEND_CENTER as f32 + frac * BEND_CENTER as f32 / bend_semis as f32) as i32
}

/// True when a bend leaves the representable window and the sounding
/// note has to be retriggered. Exactly 0 still fits the wire.
#[inline]
pub fn escapes_bend_window(bend: i32) -> bool {
    bend < 0 || bend >= 2 * BEND_CENTER
}

/// Decoder-side inverse: the pitch a synth hears for (note, bend) under
/// a given bend range.
#[inline]
pub fn reconstruct_pitch(note: u8, bend: i32, bend_semis: u8) -> f32 {
    note as f32 + (bend_semis as i32 * (bend - BEND_CENTER)) as f32 / BEND_CENTER as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_note_has_center_bend() {
        assert_eq!(note_bend_from_fnote(60.0, 2), (60, BEND_CENTER));
        assert_eq!(note_bend_from_fnote(0.0, 12), (0, BEND_CENTER));
    }

    #[test]
    fn test_half_semitone_up() {
        // Fresh mapping rounds 60.5 up; relative to 60 the bend is
        // 8192 + 0.5 * 8192 / 2 = 10240
        assert_eq!(note_bend_from_fnote(60.5, 2), (61, 6144));
        assert_eq!(bend_from_existing_note(60.5, 60, 2), 10240);
    }

    #[test]
    fn test_lower_domain_edge() {
        // -0.5 rounds to note 0, bend at the lower half-semitone edge
        let (note, bend) = note_bend_from_fnote(-0.5, 2);
        assert_eq!(note, 0);
        assert_eq!(bend, BEND_CENTER - BEND_CENTER / 4);
    }

    #[test]
    fn test_upper_domain_edge() {
        let (note, bend) = note_bend_from_fnote(127.49, 2);
        assert_eq!(note, 127);
        assert!(bend > BEND_CENTER && bend < 2 * BEND_CENTER);
    }

    #[test]
    fn test_window_escape_boundaries() {
        assert!(!escapes_bend_window(0));
        assert!(!escapes_bend_window(2 * BEND_CENTER - 1));
        assert!(escapes_bend_window(-1));
        assert!(escapes_bend_window(2 * BEND_CENTER));
    }

    #[test]
    fn test_wide_move_escapes() {
        // Three semitones away under a two-semitone range
        let bend = bend_from_existing_note(63.0, 60, 2);
        assert_eq!(bend, 20480);
        assert!(escapes_bend_window(bend));
    }

    #[test]
    fn test_reconstruct_pitch_inverts_mapping() {
        for &fnote in &[59.75f32, 60.0, 60.49, 61.2, 0.0, 127.3] {
            let (note, bend) = note_bend_from_fnote(fnote, 2);
            let pitch = reconstruct_pitch(note, bend, 2);
            // Truncation to a bend step loses at most bend_semis/8192
            assert!((pitch - fnote).abs() <= 2.0 / BEND_CENTER as f32 + f32::EPSILON);
        }
    }

    #[test]
    fn test_reconstruct_known_value() {
        // Scenario from the decoder contract: 60 + 2*(10240-8192)/8192
        let pitch = reconstruct_pitch(60, 10240, 2);
        assert!((pitch - 60.5).abs() < 1e-6);
    }
}
