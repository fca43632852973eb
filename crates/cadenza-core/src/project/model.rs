//! Immutable project snapshot types supplied by external collaborators.
//!
//! These are plain serde data; the core never reads or writes them from
//! disk. Runtime state (nodes, schedulers) is derived from snapshots by the
//! engine façade.

use crate::context::TimeSignature;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type TrackId = u64;
pub type BusId = u64;
pub type RegionId = u64;
pub type PluginId = u64;
pub type FileId = u64;

/// Minimum cycle length in beats.
pub const MIN_CYCLE_BEATS: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Midi,
    Instrument,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub tempo: f64,
    pub time_signature: TimeSignature,
    pub sample_rate: f64,
    pub tracks: Vec<Track>,
    pub buses: Vec<Bus>,
    pub cycle: CycleSettings,
}

impl Project {
    pub fn empty(tempo: f64, sample_rate: f64) -> Self {
        Self {
            tempo,
            time_signature: TimeSignature::default(),
            sample_rate,
            tracks: Vec::new(),
            buses: Vec::new(),
            cycle: CycleSettings::default(),
        }
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tempo.is_finite() && self.tempo > 0.0) {
            return Err(EngineError::InvalidTempo(self.tempo));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(EngineError::InvalidSampleRate(self.sample_rate));
        }
        self.cycle.validate()?;
        for track in &self.tracks {
            for region in &track.regions {
                region.validate()?;
            }
        }
        Ok(())
    }

    /// Any solo switches the audible set to exactly the soloed tracks.
    pub fn audible_tracks(&self) -> Vec<TrackId> {
        let any_solo = self.tracks.iter().any(|t| t.mixer.solo);
        self.tracks
            .iter()
            .filter(|t| {
                if any_solo {
                    t.mixer.solo
                } else {
                    !t.mixer.muted
                }
            })
            .map(|t| t.id)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleSettings {
    pub enabled: bool,
    pub start_beat: f64,
    pub end_beat: f64,
}

impl CycleSettings {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.end_beat < self.start_beat + MIN_CYCLE_BEATS {
            return Err(EngineError::InvalidCycle {
                start: self.start_beat,
                end: self.end_beat,
            });
        }
        Ok(())
    }
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            start_beat: 0.0,
            end_beat: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    pub kind: TrackKind,
    pub regions: Vec<AudioRegion>,
    pub midi_regions: Vec<MidiRegion>,
    pub mixer: MixerSettings,
    pub plugins: Vec<PluginConfig>,
    pub automation: Vec<AutomationLane>,
    /// Post-fader send levels (linear gain), keyed by destination bus.
    pub sends: BTreeMap<BusId, f32>,
}

impl Track {
    pub fn new(id: TrackId, name: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            regions: Vec::new(),
            midi_regions: Vec::new(),
            mixer: MixerSettings::default(),
            plugins: Vec::new(),
            automation: Vec::new(),
            sends: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    pub plugins: Vec<PluginConfig>,
    pub output_level: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixerSettings {
    /// Normalised fader position, 0..1.
    pub volume: f32,
    /// -1 (hard left) .. 1 (hard right).
    pub pan: f32,
    pub muted: bool,
    pub solo: bool,
    pub eq_low_db: f32,
    pub eq_mid_db: f32,
    pub eq_high_db: f32,
    pub record_enabled: bool,
    pub input_monitoring: bool,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            volume: 0.8,
            pan: 0.0,
            muted: false,
            solo: false,
            eq_low_db: 0.0,
            eq_mid_db: 0.0,
            eq_high_db: 0.0,
            record_enabled: false,
            input_monitoring: false,
        }
    }
}

/// Reference to decoded audio material. The PCM itself is supplied out of
/// band by the clip store; regions only carry timing metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFileRef {
    pub id: FileId,
    pub sample_rate: f64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioRegion {
    pub id: RegionId,
    pub file: AudioFileRef,
    pub start_beat: f64,
    pub duration_beats: f64,
    /// Where playback starts inside the source file.
    pub file_offset_seconds: f64,
    pub looped: bool,
    /// Tiling interval for looped regions; 0 means "use the file duration".
    pub content_length_seconds: f64,
    pub gain: f32,
    pub fade_in_seconds: f64,
    pub fade_out_seconds: f64,
}

impl AudioRegion {
    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }

    /// Looping tiles at this interval.
    pub fn effective_content_length(&self) -> f64 {
        if self.content_length_seconds > 0.0 {
            self.content_length_seconds
        } else {
            self.file.duration_seconds
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.duration_beats > 0.0) {
            return Err(EngineError::TransientGraph(format!(
                "region {} has non-positive duration",
                self.id
            )));
        }
        if self.looped && self.effective_content_length() <= 0.0 {
            return Err(EngineError::TransientGraph(format!(
                "looped region {} has no content length",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiRegion {
    pub start_beat: f64,
    pub duration_beats: f64,
    /// Content repetitions inside the region; expanded when the event list
    /// is built. Cycle playback supplies outer repetition.
    pub loop_count: u32,
    pub muted: bool,
    pub notes: Vec<MidiNote>,
    pub cc_events: Vec<ControlPoint>,
    pub pitch_bend_events: Vec<BendPoint>,
}

impl MidiRegion {
    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }
}

/// A note, relative to its region start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MidiNote {
    pub start_beat: f64,
    pub duration_beats: f64,
    pub pitch: u8,
    pub velocity: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlPoint {
    pub beat: f64,
    pub controller: u8,
    pub value: u8,
}

/// 14-bit pitch bend, 0x2000 is centre.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BendPoint {
    pub beat: f64,
    pub value: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub uid: String,
    pub name: String,
    pub vendor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub id: PluginId,
    pub descriptor: PluginDescriptor,
    pub bypassed: bool,
    pub sidechain_source: Option<TrackId>,
    /// Opaque state blob restored after load.
    pub state: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutomationParameter {
    Volume,
    Pan,
    EqLow,
    EqMid,
    EqHigh,
    PluginParam(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolation {
    Linear,
    Step,
    Exponential,
}

/// Automation point; the interpolation applies to the segment leading to
/// the next point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutomationPoint {
    pub beat: f64,
    pub value: f32,
    pub interpolation: Interpolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationLane {
    pub parameter: AutomationParameter,
    /// Sorted by beat.
    pub points: Vec<AutomationPoint>,
}

impl AutomationLane {
    pub fn new(parameter: AutomationParameter) -> Self {
        Self {
            parameter,
            points: Vec::new(),
        }
    }

    /// Evaluate the lane at a beat. `None` when the lane has no points.
    pub fn value_at(&self, beat: f64) -> Option<f32> {
        let points = &self.points;
        if points.is_empty() {
            return None;
        }
        if beat <= points[0].beat {
            return Some(points[0].value);
        }
        let last = points[points.len() - 1];
        if beat >= last.beat {
            return Some(last.value);
        }

        // points is sorted; find the segment containing `beat`.
        let next_idx = points.partition_point(|p| p.beat <= beat);
        let a = points[next_idx - 1];
        let b = points[next_idx];
        let span = b.beat - a.beat;
        if span <= f64::EPSILON {
            return Some(b.value);
        }
        let t = ((beat - a.beat) / span) as f32;

        Some(match a.interpolation {
            Interpolation::Step => a.value,
            Interpolation::Linear => a.value + (b.value - a.value) * t,
            Interpolation::Exponential => {
                let from = a.value.max(1e-3);
                let to = b.value.max(1e-3);
                from * (to / from).powf(t)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn file() -> AudioFileRef {
        AudioFileRef {
            id: 1,
            sample_rate: 44_100.0,
            duration_seconds: 2.0,
        }
    }

    fn region() -> AudioRegion {
        AudioRegion {
            id: 1,
            file: file(),
            start_beat: 0.0,
            duration_beats: 4.0,
            file_offset_seconds: 0.0,
            looped: false,
            content_length_seconds: 0.0,
            gain: 1.0,
            fade_in_seconds: 0.0,
            fade_out_seconds: 0.0,
        }
    }

    #[test]
    fn content_length_zero_uses_file_duration() {
        let r = region();
        assert_abs_diff_eq!(r.effective_content_length(), 2.0);

        let mut tiled = region();
        tiled.content_length_seconds = 3.5;
        assert_abs_diff_eq!(tiled.effective_content_length(), 3.5);
    }

    #[test]
    fn region_validation() {
        let mut bad = region();
        bad.duration_beats = 0.0;
        assert!(bad.validate().is_err());
        assert!(region().validate().is_ok());
    }

    #[test]
    fn cycle_needs_quarter_beat() {
        let cycle = CycleSettings {
            enabled: true,
            start_beat: 2.0,
            end_beat: 2.1,
        };
        assert!(cycle.validate().is_err());

        let ok = CycleSettings {
            enabled: true,
            start_beat: 2.0,
            end_beat: 2.25,
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn solo_policy() {
        let mut project = Project::empty(120.0, 48_000.0);
        project.tracks.push(Track::new(1, "drums", TrackKind::Audio));
        project.tracks.push(Track::new(2, "bass", TrackKind::Audio));
        project.tracks.push(Track::new(3, "keys", TrackKind::Midi));
        project.tracks[1].mixer.muted = true;

        // No solo: audible = not muted.
        assert_eq!(project.audible_tracks(), vec![1, 3]);

        // Solo wins over everything, including its own mute.
        project.tracks[1].mixer.solo = true;
        assert_eq!(project.audible_tracks(), vec![2]);
    }

    #[test]
    fn lane_interpolation_modes() {
        let mut lane = AutomationLane::new(AutomationParameter::Volume);
        lane.points = vec![
            AutomationPoint {
                beat: 0.0,
                value: 0.0,
                interpolation: Interpolation::Linear,
            },
            AutomationPoint {
                beat: 4.0,
                value: 1.0,
                interpolation: Interpolation::Step,
            },
            AutomationPoint {
                beat: 8.0,
                value: 0.5,
                interpolation: Interpolation::Linear,
            },
        ];

        assert_abs_diff_eq!(lane.value_at(-1.0).unwrap(), 0.0);
        assert_abs_diff_eq!(lane.value_at(2.0).unwrap(), 0.5, epsilon = 1e-6);
        // Step segment holds its left value until the next point.
        assert_abs_diff_eq!(lane.value_at(6.0).unwrap(), 1.0);
        assert_abs_diff_eq!(lane.value_at(9.0).unwrap(), 0.5);
    }

    #[test]
    fn lane_exponential_guards_zero() {
        let mut lane = AutomationLane::new(AutomationParameter::Volume);
        lane.points = vec![
            AutomationPoint {
                beat: 0.0,
                value: 0.0,
                interpolation: Interpolation::Exponential,
            },
            AutomationPoint {
                beat: 1.0,
                value: 1.0,
                interpolation: Interpolation::Linear,
            },
        ];
        let mid = lane.value_at(0.5).unwrap();
        assert!(mid.is_finite() && mid > 0.0);
    }

    #[test]
    fn empty_lane_yields_none() {
        let lane = AutomationLane::new(AutomationParameter::Pan);
        assert!(lane.value_at(1.0).is_none());
    }
}
