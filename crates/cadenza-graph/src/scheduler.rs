//! Region scheduling: musical time to sample-offset segments on the
//! player, with plugin-delay compensation folded into every delay.
//!
//! Source-frame math runs at the file rate, when-to-play math at the
//! player rate; the two are generally different.

use crate::format::GraphFormat;
use crate::player::{AudioClip, ClipStore, Segment};
use crate::track::TrackNode;
use cadenza_core::context::SchedulingContext;
use cadenza_core::error::{Component, EngineError, ErrorTracker, Result};
use cadenza_core::project::{AudioRegion, Track};
use std::sync::Arc;

/// Extra cycle iterations queued ahead of the current one so the boundary
/// always has audio ready.
pub const CYCLE_PRESCHEDULE_ITERATIONS: usize = 2;

pub struct ScheduleParams<'a> {
    /// Beat the scheduled window begins at.
    pub start_beat: f64,
    pub context: &'a SchedulingContext,
    /// This track's PDC compensation, in seconds at the player rate.
    pub pdc_seconds: f64,
    /// Active cycle bounds for the pre-scheduling variant.
    pub cycle: Option<(f64, f64)>,
    /// Where `start_beat` falls on the player's running time axis. Zero
    /// when the player starts with the schedule; positive when topping up
    /// iterations behind a clock that kept running across a cycle jump.
    pub clock_offset_seconds: f64,
    /// Keep the player's clock running across the reschedule (seamless
    /// cycle jumps).
    pub preserve_playback: bool,
}

/// Validate the chain before any schedule lands on it. Failures are
/// track-scoped: recorded, and only this track's scheduling is aborted.
fn validate_chain(node: &mut TrackNode, format: GraphFormat) -> Result<()> {
    if !node.is_attached() {
        return Err(EngineError::NodeNotAttached(format!("track {}", node.id)));
    }
    let track_id = node.id;
    let Some(player) = node.player_mut() else {
        return Err(EngineError::NodeNotAttached(format!(
            "track {track_id} has no player"
        )));
    };
    if !player.is_attached() {
        return Err(EngineError::NodeNotAttached(format!(
            "player on track {track_id}"
        )));
    }
    let player_rate = player.sample_rate();
    if !(player_rate > 0.0) || !(format.sample_rate > 0.0) {
        return Err(EngineError::FormatMismatch {
            track: track_id,
            detail: format!("non-positive rate: player {player_rate}, hw {}", format.sample_rate),
        });
    }
    if !format.rate_compatible_with(player_rate) {
        return Err(EngineError::FormatMismatch {
            track: track_id,
            detail: format!(
                "player rate {player_rate} outside half..double of hardware {}",
                format.sample_rate
            ),
        });
    }
    Ok(())
}

/// Schedule all of a track's regions onto its player.
pub fn schedule_track(
    node: &mut TrackNode,
    track: &Track,
    clips: &ClipStore,
    format: GraphFormat,
    params: &ScheduleParams<'_>,
    tracker: &ErrorTracker,
) -> Result<()> {
    if let Err(e) = validate_chain(node, format) {
        tracker.error(Component::Track, format!("schedule aborted: {e}"));
        return Err(e);
    }

    let mut segments = Vec::new();
    for region in &track.regions {
        if let Err(e) = region.validate() {
            tracker.warn(Component::Track, format!("region {} skipped: {e}", region.id));
            continue;
        }
        let Some(clip) = clips.get(region.file.id) else {
            tracker.warn(
                Component::Track,
                format!("region {}: clip {} not loaded", region.id, region.file.id),
            );
            continue;
        };

        match params.cycle {
            None => build_segments(
                region,
                &clip,
                params.start_beat,
                None,
                params.clock_offset_seconds,
                params,
                &mut segments,
            ),
            Some((cycle_start, cycle_end)) => {
                // Current pass runs from the start beat to the boundary,
                // then N full iterations are pre-queued behind it.
                let ctx = params.context;
                let mut delay_offset = params.clock_offset_seconds
                    + ctx.beats_to_seconds(cycle_end)
                    - ctx.beats_to_seconds(params.start_beat);
                build_segments(
                    region,
                    &clip,
                    params.start_beat,
                    Some(cycle_end),
                    params.clock_offset_seconds,
                    params,
                    &mut segments,
                );
                for _ in 0..CYCLE_PRESCHEDULE_ITERATIONS {
                    build_segments(
                        region,
                        &clip,
                        cycle_start,
                        Some(cycle_end),
                        delay_offset,
                        params,
                        &mut segments,
                    );
                    delay_offset +=
                        ctx.beats_to_seconds(cycle_end) - ctx.beats_to_seconds(cycle_start);
                }
            }
        }
    }

    let player = node.player_mut().expect("validated above");
    player.clear_schedule(params.preserve_playback);
    for segment in segments {
        player.schedule(segment);
    }
    Ok(())
}

/// Emit the segments of one region for a playback window starting at
/// `window_start` beats (optionally clipped at `window_end`), delayed by
/// `delay_offset_seconds` on the player's time axis.
fn build_segments(
    region: &AudioRegion,
    clip: &Arc<AudioClip>,
    window_start: f64,
    window_end: Option<f64>,
    delay_offset_seconds: f64,
    params: &ScheduleParams<'_>,
    out: &mut Vec<Segment>,
) {
    let ctx = params.context;
    let player_rate = ctx.sample_rate();
    let file_rate = clip.sample_rate;

    let start_seconds = ctx.beats_to_seconds(window_start);
    let region_start = ctx.beats_to_seconds(region.start_beat);
    let region_end = ctx.beats_to_seconds(region.end_beat());
    let window_end_seconds = window_end.map(|b| ctx.beats_to_seconds(b));

    let hard_end = match window_end_seconds {
        Some(w) => region_end.min(w),
        None => region_end,
    };
    if hard_end <= start_seconds {
        return;
    }

    let file_duration = clip.duration_seconds();
    let fade_in_samples = (region.fade_in_seconds * player_rate).round() as u64;
    let fade_out_samples = (region.fade_out_seconds * player_rate).round() as u64;

    // (audio_start_abs, audio_len, extra_file_offset) per content tile.
    let tiles: Vec<(f64, f64, f64)> = if region.looped {
        let content = region.effective_content_length();
        let audio_len = (file_duration - region.file_offset_seconds).min(content);
        if audio_len <= 0.0 || content <= 0.0 {
            return;
        }
        let region_len = region_end - region_start;
        let count = (region_len / content).ceil() as usize;
        (0..count)
            .map(|k| (region_start + k as f64 * content, audio_len, 0.0))
            .collect()
    } else {
        let audio_len = file_duration - region.file_offset_seconds;
        if audio_len <= 0.0 {
            return;
        }
        vec![(region_start, audio_len, 0.0)]
    };

    for (audio_start, audio_len, _) in tiles {
        let audio_end = (audio_start + audio_len).min(hard_end);
        if audio_end <= start_seconds || audio_start >= hard_end {
            continue;
        }

        let delay_seconds =
            (audio_start - start_seconds).max(0.0) + params.pdc_seconds + delay_offset_seconds;
        let skip_into_tile = (start_seconds - audio_start).max(0.0);
        let offset_in_file = skip_into_tile + region.file_offset_seconds;
        let playable = audio_end - audio_start.max(start_seconds);
        if playable <= 0.0 {
            continue;
        }

        // Region-edge fades only: fade-in on an untruncated head, fade-out
        // on a tail that reaches the region end.
        let has_head = skip_into_tile == 0.0 && audio_start == region_start;
        let has_tail = (audio_end - region_end).abs() < 1e-9;

        out.push(Segment {
            clip: Arc::clone(clip),
            delay_samples: (delay_seconds * player_rate).round() as u64,
            start_frame: offset_in_file * file_rate,
            frame_count: playable * file_rate,
            gain: region.gain,
            fade_in_samples: if has_head { fade_in_samples } else { 0 },
            fade_out_samples: if has_tail { fade_out_samples } else { 0 },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::context::TimeSignature;
    use cadenza_core::metering::AtomicAmplitude;
    use cadenza_core::project::{AudioFileRef, MixerSettings, TrackKind};

    fn ctx(tempo: f64) -> SchedulingContext {
        SchedulingContext::new(48_000.0, tempo, TimeSignature::default()).unwrap()
    }

    fn clip_store_with(duration_seconds: f64, file_rate: f64) -> ClipStore {
        let store = ClipStore::new();
        let frames = (duration_seconds * file_rate) as usize;
        store.insert(
            1,
            Arc::new(AudioClip::from_mono(file_rate, vec![0.5; frames])),
        );
        store
    }

    fn region(start_beat: f64, duration_beats: f64, file_duration: f64, file_rate: f64) -> AudioRegion {
        AudioRegion {
            id: 1,
            file: AudioFileRef {
                id: 1,
                sample_rate: file_rate,
                duration_seconds: file_duration,
            },
            start_beat,
            duration_beats,
            file_offset_seconds: 0.0,
            looped: false,
            content_length_seconds: 0.0,
            gain: 1.0,
            fade_in_seconds: 0.0,
            fade_out_seconds: 0.0,
        }
    }

    fn track_with_region(region: AudioRegion) -> Track {
        let mut track = Track::new(1, "audio", TrackKind::Audio);
        track.regions.push(region);
        track
    }

    fn node() -> TrackNode {
        let mut node = TrackNode::new(
            1,
            TrackKind::Audio,
            &MixerSettings::default(),
            GraphFormat::standard(48_000.0),
            Arc::new(AtomicAmplitude::new()),
        );
        node.rebuild(GraphFormat::standard(48_000.0));
        node
    }

    fn params(ctx: &SchedulingContext, start_beat: f64, pdc_seconds: f64) -> ScheduleParams<'_> {
        ScheduleParams {
            start_beat,
            context: ctx,
            pdc_seconds,
            cycle: None,
            clock_offset_seconds: 0.0,
            preserve_playback: false,
        }
    }

    fn schedule(
        node: &mut TrackNode,
        track: &Track,
        clips: &ClipStore,
        params: &ScheduleParams<'_>,
    ) -> Result<()> {
        schedule_track(
            node,
            track,
            clips,
            GraphFormat::standard(48_000.0),
            params,
            &ErrorTracker::new(),
        )
    }

    /// Render the node's player and return the first sample index with
    /// signal.
    fn first_audible_sample(node: &mut TrackNode, total: usize) -> Option<usize> {
        let player = node.player_mut().unwrap();
        player.play();
        let mut out = vec![0.0f32; total * 2];
        let mut done = 0;
        while done < total {
            let n = 512.min(total - done);
            player.render(&mut out[done * 2..(done + n) * 2], n);
            done += n;
        }
        out.chunks(2).position(|f| f[0] != 0.0)
    }

    #[test]
    fn pdc_compensation_is_added_to_delay() {
        // Scenario: two identical 4-beat regions at beat 0, 48 kHz, 120
        // bpm. The no-plugin track carries the full 2048-sample
        // compensation; the latent track none.
        let c = ctx(120.0);
        let clips = clip_store_with(4.0, 48_000.0);
        let track = track_with_region(region(0.0, 4.0, 4.0, 48_000.0));

        let mut node_a = node();
        schedule(&mut node_a, &track, &clips, &params(&c, 0.0, 2_048.0 / 48_000.0)).unwrap();
        let mut node_b = node();
        schedule(&mut node_b, &track, &clips, &params(&c, 0.0, 0.0)).unwrap();

        assert_eq!(first_audible_sample(&mut node_a, 4_096), Some(2_048));
        assert_eq!(first_audible_sample(&mut node_b, 4_096), Some(0));
    }

    #[test]
    fn start_mid_region_reads_file_offset() {
        // Scenario: region spanning beats 0..8 at 120 bpm; starting at
        // beat 6 reads 3.0 s into the file and plays immediately.
        let c = ctx(120.0);
        let clips = clip_store_with(4.0, 48_000.0);
        let track = track_with_region(region(0.0, 8.0, 4.0, 48_000.0));

        let mut n = node();
        schedule(&mut n, &track, &clips, &params(&c, 6.0, 0.0)).unwrap();

        let player = n.player_mut().unwrap();
        assert_eq!(player.segment_count(), 1);
        player.play();
        let mut out = vec![0.0f32; 8];
        player.render(&mut out, 4);
        // Clip is constant 0.5; the point is it starts at sample 0.
        assert_eq!(out[0], 0.5);

        // Verify the file offset by scheduling a ramp clip instead.
        let ramp_store = ClipStore::new();
        ramp_store.insert(
            1,
            Arc::new(AudioClip::from_mono(
                48_000.0,
                (0..192_000).map(|i| i as f32).collect(),
            )),
        );
        let mut n3 = node();
        schedule_track(
            &mut n3,
            &track_with_region(region(0.0, 8.0, 4.0, 48_000.0)),
            &ramp_store,
            GraphFormat::standard(48_000.0),
            &params(&c, 6.0, 0.0),
            &ErrorTracker::new(),
        )
        .unwrap();
        let player = n3.player_mut().unwrap();
        player.play();
        let mut out = vec![0.0f32; 8];
        player.render(&mut out, 4);
        // 3.0 s into the file at 48 kHz is frame 144000.
        assert!((out[0] - 144_000.0).abs() < 1.0, "got {}", out[0]);
    }

    #[test]
    fn region_entirely_before_start_is_skipped() {
        let c = ctx(120.0);
        let clips = clip_store_with(1.0, 48_000.0);
        let track = track_with_region(region(0.0, 2.0, 1.0, 48_000.0));

        let mut n = node();
        schedule(&mut n, &track, &clips, &params(&c, 4.0, 0.0)).unwrap();
        assert_eq!(n.player_mut().unwrap().segment_count(), 0);
    }

    #[test]
    fn future_region_is_delayed() {
        let c = ctx(120.0);
        let clips = clip_store_with(1.0, 48_000.0);
        // Region starts at beat 2 = 1.0 s = 48000 samples.
        let track = track_with_region(region(2.0, 2.0, 1.0, 48_000.0));

        let mut n = node();
        schedule(&mut n, &track, &clips, &params(&c, 0.0, 0.0)).unwrap();
        assert_eq!(first_audible_sample(&mut n, 96_000), Some(48_000));
    }

    #[test]
    fn looped_region_tiles_with_silence_gaps() {
        let c = ctx(120.0);
        // 0.25 s of audio tiling at 0.5 s intervals across 4 beats (2 s).
        let clips = clip_store_with(0.25, 48_000.0);
        let mut r = region(0.0, 4.0, 0.25, 48_000.0);
        r.looped = true;
        r.content_length_seconds = 0.5;
        let track = track_with_region(r);

        let mut n = node();
        schedule(&mut n, &track, &clips, &params(&c, 0.0, 0.0)).unwrap();
        let player = n.player_mut().unwrap();
        assert_eq!(player.segment_count(), 4);

        player.play();
        let total = 96_000;
        let mut out = vec![0.0f32; total * 2];
        let mut done = 0;
        while done < total {
            let n_frames = 512.min(total - done);
            player.render(&mut out[done * 2..(done + n_frames) * 2], n_frames);
            done += n_frames;
        }
        // Audio for the first 12000 frames, silence for the next 12000.
        assert_eq!(out[6_000 * 2], 0.5);
        assert_eq!(out[18_000 * 2], 0.0);
        assert_eq!(out[24_006 * 2], 0.5);
    }

    #[test]
    fn content_length_zero_tiles_at_file_duration() {
        let c = ctx(120.0);
        let clips = clip_store_with(0.5, 48_000.0);
        let mut r = region(0.0, 4.0, 0.5, 48_000.0);
        r.looped = true;
        r.content_length_seconds = 0.0; // means file duration
        let track = track_with_region(r);

        let mut n = node();
        schedule(&mut n, &track, &clips, &params(&c, 0.0, 0.0)).unwrap();
        // 2 s region / 0.5 s tiles = 4 back-to-back segments.
        assert_eq!(n.player_mut().unwrap().segment_count(), 4);
    }

    #[test]
    fn cycle_variant_preschedules_iterations() {
        let c = ctx(120.0);
        let clips = clip_store_with(4.0, 48_000.0);
        // Region covers the whole 2..6 cycle.
        let track = track_with_region(region(2.0, 4.0, 4.0, 48_000.0));

        let mut n = node();
        let p = ScheduleParams {
            start_beat: 2.0,
            context: &c,
            pdc_seconds: 0.0,
            cycle: Some((2.0, 6.0)),
            clock_offset_seconds: 0.0,
            preserve_playback: true,
        };
        schedule(&mut n, &track, &clips, &p).unwrap();
        // Current pass plus two pre-scheduled iterations.
        assert_eq!(
            n.player_mut().unwrap().segment_count(),
            1 + CYCLE_PRESCHEDULE_ITERATIONS
        );
    }

    #[test]
    fn missing_clip_skips_region_but_not_track() {
        let c = ctx(120.0);
        let clips = ClipStore::new();
        let track = track_with_region(region(0.0, 4.0, 4.0, 48_000.0));
        let tracker = ErrorTracker::new();

        let mut n = node();
        schedule_track(
            &mut n,
            &track,
            &clips,
            GraphFormat::standard(48_000.0),
            &params(&c, 0.0, 0.0),
            &tracker,
        )
        .unwrap();
        assert_eq!(n.player_mut().unwrap().segment_count(), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn detached_node_aborts_with_tracked_error() {
        let c = ctx(120.0);
        let clips = clip_store_with(4.0, 48_000.0);
        let track = track_with_region(region(0.0, 4.0, 4.0, 48_000.0));
        let tracker = ErrorTracker::new();

        let mut n = node();
        n.teardown();
        let result = schedule_track(
            &mut n,
            &track,
            &clips,
            GraphFormat::standard(48_000.0),
            &params(&c, 0.0, 0.0),
            &tracker,
        );
        assert!(matches!(result, Err(EngineError::NodeNotAttached(_))));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn incompatible_player_rate_is_format_mismatch() {
        let c = ctx(120.0);
        let clips = clip_store_with(4.0, 48_000.0);
        let track = track_with_region(region(0.0, 4.0, 4.0, 48_000.0));
        let tracker = ErrorTracker::new();

        let mut n = node();
        n.player_mut().unwrap().set_sample_rate(8_000.0);
        let result = schedule_track(
            &mut n,
            &track,
            &clips,
            GraphFormat::standard(48_000.0),
            &params(&c, 0.0, 0.0),
            &tracker,
        );
        assert!(matches!(result, Err(EngineError::FormatMismatch { .. })));
    }
}
