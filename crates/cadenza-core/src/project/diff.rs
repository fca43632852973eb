//! Snapshot comparison: derives the minimum mutation set between two
//! project snapshots so the engine only touches what actually changed.

use super::model::{AudioRegion, CycleSettings, MixerSettings, Project, RegionId, Track, TrackId};
use std::collections::HashMap;

/// Region moves below this wall-clock threshold are ignored.
const MOVE_THRESHOLD_SECONDS: f64 = 0.001;

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectChange {
    TrackAdded(Track),
    TrackRemoved(TrackId),
    RegionAdded {
        track: TrackId,
        region: AudioRegion,
    },
    RegionRemoved {
        track: TrackId,
        region: RegionId,
    },
    RegionMoved {
        track: TrackId,
        region: RegionId,
        delta_beats: f64,
    },
    MixerChanged {
        track: TrackId,
        mixer: MixerSettings,
    },
    PluginsChanged {
        track: TrackId,
    },
    SendsChanged {
        track: TrackId,
    },
    MidiChanged {
        track: TrackId,
    },
    AutomationChanged {
        track: TrackId,
    },
    TempoChanged(f64),
    CycleChanged(CycleSettings),
}

/// Compare two snapshots. Changes are emitted coarsest-first: removals, then
/// additions, then in-place edits.
pub fn diff(old: &Project, new: &Project) -> Vec<ProjectChange> {
    let mut changes = Vec::new();

    if (old.tempo - new.tempo).abs() > f64::EPSILON {
        changes.push(ProjectChange::TempoChanged(new.tempo));
    }
    if old.cycle != new.cycle {
        changes.push(ProjectChange::CycleChanged(new.cycle));
    }

    let old_tracks: HashMap<TrackId, &Track> = old.tracks.iter().map(|t| (t.id, t)).collect();
    let new_tracks: HashMap<TrackId, &Track> = new.tracks.iter().map(|t| (t.id, t)).collect();

    for track in &old.tracks {
        if !new_tracks.contains_key(&track.id) {
            changes.push(ProjectChange::TrackRemoved(track.id));
        }
    }

    for track in &new.tracks {
        match old_tracks.get(&track.id) {
            None => changes.push(ProjectChange::TrackAdded(track.clone())),
            Some(before) => diff_track(before, track, new.tempo, &mut changes),
        }
    }

    changes
}

fn diff_track(old: &Track, new: &Track, tempo: f64, changes: &mut Vec<ProjectChange>) {
    let old_regions: HashMap<RegionId, &AudioRegion> =
        old.regions.iter().map(|r| (r.id, r)).collect();
    let new_regions: HashMap<RegionId, &AudioRegion> =
        new.regions.iter().map(|r| (r.id, r)).collect();

    for region in &old.regions {
        if !new_regions.contains_key(&region.id) {
            changes.push(ProjectChange::RegionRemoved {
                track: new.id,
                region: region.id,
            });
        }
    }

    for region in &new.regions {
        match old_regions.get(&region.id) {
            None => changes.push(ProjectChange::RegionAdded {
                track: new.id,
                region: region.clone(),
            }),
            Some(before) => {
                let delta_beats = region.start_beat - before.start_beat;
                let delta_seconds = delta_beats.abs() * 60.0 / tempo;
                if delta_seconds > MOVE_THRESHOLD_SECONDS {
                    changes.push(ProjectChange::RegionMoved {
                        track: new.id,
                        region: region.id,
                        delta_beats,
                    });
                }
            }
        }
    }

    if old.mixer != new.mixer {
        changes.push(ProjectChange::MixerChanged {
            track: new.id,
            mixer: new.mixer,
        });
    }
    if old.plugins != new.plugins {
        changes.push(ProjectChange::PluginsChanged { track: new.id });
    }
    if old.sends != new.sends {
        changes.push(ProjectChange::SendsChanged { track: new.id });
    }
    if old.midi_regions != new.midi_regions {
        changes.push(ProjectChange::MidiChanged { track: new.id });
    }
    if old.automation != new.automation {
        changes.push(ProjectChange::AutomationChanged { track: new.id });
    }
}
