//! RT-safe MIDI event types carrying raw status bytes.

use cadenza_core::project::{MidiRegion, TrackId};

/// Channel voice status bytes (channel 0).
pub mod status {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const CONTROL_CHANGE: u8 = 0xB0;
    pub const PITCH_BEND: u8 = 0xE0;
}

/// All Notes Off controller number.
pub const CC_ALL_NOTES_OFF: u8 = 123;

/// Raw three-byte channel voice message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiMessage {
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
}

impl MidiMessage {
    #[inline]
    pub fn note_on(pitch: u8, velocity: u8) -> Self {
        Self {
            status: status::NOTE_ON,
            data1: pitch & 0x7F,
            data2: velocity & 0x7F,
        }
    }

    #[inline]
    pub fn note_off(pitch: u8) -> Self {
        Self {
            status: status::NOTE_OFF,
            data1: pitch & 0x7F,
            data2: 0,
        }
    }

    #[inline]
    pub fn control_change(controller: u8, value: u8) -> Self {
        Self {
            status: status::CONTROL_CHANGE,
            data1: controller & 0x7F,
            data2: value & 0x7F,
        }
    }

    /// 14-bit pitch bend, 0x2000 is centre.
    #[inline]
    pub fn pitch_bend(value: u16) -> Self {
        Self {
            status: status::PITCH_BEND,
            data1: (value & 0x7F) as u8,
            data2: ((value >> 7) & 0x7F) as u8,
        }
    }

    #[inline]
    pub fn all_notes_off() -> Self {
        Self::control_change(CC_ALL_NOTES_OFF, 0)
    }

    #[inline]
    pub fn is_note_on(&self) -> bool {
        self.status & 0xF0 == status::NOTE_ON && self.data2 > 0
    }

    #[inline]
    pub fn is_note_off(&self) -> bool {
        self.status & 0xF0 == status::NOTE_OFF
            || (self.status & 0xF0 == status::NOTE_ON && self.data2 == 0)
    }
}

/// One event on the global schedule, totally ordered by beat (ties keep
/// load order through stable sorting).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledMidiEvent {
    pub beat: f64,
    pub message: MidiMessage,
    pub track: TrackId,
}

/// Expand a region's notes, controllers and bends into absolute-beat events.
///
/// `loop_count` repetitions of the content are laid out back to back inside
/// the region; everything is clipped to the region bounds. Muting is the
/// caller's concern (solo policy lives at the schedule-build level).
pub fn expand_region(region: &MidiRegion, track: TrackId, out: &mut Vec<ScheduledMidiEvent>) {
    let iterations = region.loop_count.max(1);
    let iteration_len = region.duration_beats / iterations as f64;
    let region_end = region.end_beat();

    for iteration in 0..iterations {
        let base = region.start_beat + iteration as f64 * iteration_len;

        for note in &region.notes {
            let on_beat = base + note.start_beat;
            if on_beat >= region_end {
                continue;
            }
            let off_beat = (on_beat + note.duration_beats).min(region_end);
            out.push(ScheduledMidiEvent {
                beat: on_beat,
                message: MidiMessage::note_on(note.pitch, note.velocity),
                track,
            });
            out.push(ScheduledMidiEvent {
                beat: off_beat,
                message: MidiMessage::note_off(note.pitch),
                track,
            });
        }

        for cc in &region.cc_events {
            let beat = base + cc.beat;
            if beat < region_end {
                out.push(ScheduledMidiEvent {
                    beat,
                    message: MidiMessage::control_change(cc.controller, cc.value),
                    track,
                });
            }
        }

        for bend in &region.pitch_bend_events {
            let beat = base + bend.beat;
            if beat < region_end {
                out.push(ScheduledMidiEvent {
                    beat,
                    message: MidiMessage::pitch_bend(bend.value),
                    track,
                });
            }
        }
    }
}
