//! Region player: plays pre-scheduled source-file segments at sample
//! offsets from its own play() instant.

use cadenza_core::project::FileId;
use dashmap::DashMap;
use std::sync::Arc;

/// Decoded PCM supplied by external collaborators (decoding is out of
/// scope). Interleaved stereo; mono sources are duplicated on read.
pub struct AudioClip {
    pub sample_rate: f64,
    pub channels: usize,
    samples: Vec<f32>,
}

impl AudioClip {
    pub fn new(sample_rate: f64, channels: usize, samples: Vec<f32>) -> Self {
        assert!(channels == 1 || channels == 2, "mono or stereo clips only");
        Self {
            sample_rate,
            channels,
            samples,
        }
    }

    /// Convenience constructor for mono material.
    pub fn from_mono(sample_rate: f64, samples: Vec<f32>) -> Self {
        Self::new(sample_rate, 1, samples)
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.sample_rate
    }

    #[inline]
    fn frame(&self, index: usize) -> (f32, f32) {
        if index >= self.frames() {
            return (0.0, 0.0);
        }
        if self.channels == 1 {
            let s = self.samples[index];
            (s, s)
        } else {
            (self.samples[index * 2], self.samples[index * 2 + 1])
        }
    }

    /// Linear interpolation at a fractional frame position.
    #[inline]
    pub fn sample_at(&self, position: f64) -> (f32, f32) {
        if position < 0.0 {
            return (0.0, 0.0);
        }
        let index = position.floor() as usize;
        let t = (position - index as f64) as f32;
        let (l0, r0) = self.frame(index);
        let (l1, r1) = self.frame(index + 1);
        (l0 + (l1 - l0) * t, r0 + (r1 - r0) * t)
    }
}

/// Id-keyed clip registry shared between the control thread (insert) and
/// schedule building.
pub struct ClipStore {
    clips: DashMap<FileId, Arc<AudioClip>>,
}

impl ClipStore {
    pub fn new() -> Self {
        Self {
            clips: DashMap::new(),
        }
    }

    pub fn insert(&self, id: FileId, clip: Arc<AudioClip>) {
        self.clips.insert(id, clip);
    }

    pub fn get(&self, id: FileId) -> Option<Arc<AudioClip>> {
        self.clips.get(&id).map(|c| Arc::clone(c.value()))
    }

    pub fn remove(&self, id: FileId) {
        self.clips.remove(&id);
    }
}

impl Default for ClipStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One scheduled slice of source material.
///
/// `delay_samples` counts player-rate samples from the player's play()
/// instant; `start_frame` / `frame_count` count file-rate frames. The two
/// rates are independent and must not be conflated.
pub struct Segment {
    pub clip: Arc<AudioClip>,
    pub delay_samples: u64,
    pub start_frame: f64,
    pub frame_count: f64,
    pub gain: f32,
    pub fade_in_samples: u64,
    pub fade_out_samples: u64,
}

impl Segment {
    /// Segment length expressed in player samples.
    fn length_samples(&self, player_rate: f64) -> u64 {
        (self.frame_count / self.clip.sample_rate * player_rate).round() as u64
    }
}

/// Sample-clock player node at the head of a track chain. Gaps between
/// segments are an absence of schedule, not scheduled zeros.
pub struct RegionPlayer {
    sample_rate: f64,
    segments: Vec<Segment>,
    position: u64,
    playing: bool,
    attached: bool,
}

impl RegionPlayer {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            segments: Vec::new(),
            position: 0,
            playing: false,
            attached: false,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
    }

    pub fn attach(&mut self) {
        self.attached = true;
    }

    /// No-op when not attached.
    pub fn detach(&mut self) {
        self.attached = false;
        self.stop();
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Start the player's time axis at sample 0.
    pub fn play(&mut self) {
        self.position = 0;
        self.playing = true;
    }

    /// No-op when already stopped.
    pub fn stop(&mut self) {
        self.playing = false;
        self.position = 0;
    }

    /// Halt without resetting the sample clock (track-scoped hot-swaps).
    pub fn pause(&mut self) {
        self.playing = false;
    }

    /// Continue from the paused clock position.
    pub fn resume(&mut self) {
        self.playing = true;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Queue a segment. Schedules issued before play() start at the first
    /// frame; schedules issued while playing join at their offset.
    pub fn schedule(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// Replace the schedule. With `preserve_playback` the sample clock and
    /// play state survive (seamless cycle jumps); otherwise the player
    /// resets to sample 0.
    pub fn clear_schedule(&mut self, preserve_playback: bool) {
        self.segments.clear();
        if !preserve_playback {
            self.position = 0;
            self.playing = false;
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Render `frames` frames of interleaved stereo, accumulating into
    /// `out`, and advance the sample clock.
    pub fn render(&mut self, out: &mut [f32], frames: usize) {
        if !self.playing || !self.attached {
            return;
        }
        let player_rate = self.sample_rate;
        let buffer_start = self.position;

        for segment in &self.segments {
            let seg_len = segment.length_samples(player_rate);
            if seg_len == 0 {
                continue;
            }
            let seg_start = segment.delay_samples;
            let seg_end = seg_start + seg_len;
            if seg_end <= buffer_start || seg_start >= buffer_start + frames as u64 {
                continue;
            }

            let rate_ratio = segment.clip.sample_rate / player_rate;
            let first = seg_start.max(buffer_start);
            let last = seg_end.min(buffer_start + frames as u64);

            for abs in first..last {
                let t = abs - seg_start; // player samples into the segment
                let file_pos = segment.start_frame + t as f64 * rate_ratio;
                let (l, r) = segment.clip.sample_at(file_pos);

                let mut gain = segment.gain;
                if segment.fade_in_samples > 0 && t < segment.fade_in_samples {
                    gain *= t as f32 / segment.fade_in_samples as f32;
                }
                if segment.fade_out_samples > 0 {
                    let remaining = seg_len - t;
                    if remaining <= segment.fade_out_samples {
                        gain *= remaining as f32 / segment.fade_out_samples as f32;
                    }
                }

                let slot = ((abs - buffer_start) * 2) as usize;
                out[slot] += l * gain;
                out[slot + 1] += r * gain;
            }
        }

        self.position += frames as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp_clip(rate: f64, frames: usize) -> Arc<AudioClip> {
        Arc::new(AudioClip::from_mono(
            rate,
            (0..frames).map(|i| i as f32).collect(),
        ))
    }

    fn ones_clip(rate: f64, frames: usize) -> Arc<AudioClip> {
        Arc::new(AudioClip::from_mono(rate, vec![1.0; frames]))
    }

    fn segment(clip: Arc<AudioClip>, delay: u64, start_frame: f64, frame_count: f64) -> Segment {
        Segment {
            clip,
            delay_samples: delay,
            start_frame,
            frame_count,
            gain: 1.0,
            fade_in_samples: 0,
            fade_out_samples: 0,
        }
    }

    fn render_all(player: &mut RegionPlayer, total: usize, chunk: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; total * 2];
        let mut done = 0;
        while done < total {
            let n = chunk.min(total - done);
            player.render(&mut out[done * 2..(done + n) * 2], n);
            done += n;
        }
        out
    }

    #[test]
    fn plays_from_first_frame_when_scheduled_before_play() {
        let mut player = RegionPlayer::new(48_000.0);
        player.attach();
        player.schedule(segment(ramp_clip(48_000.0, 1_000), 0, 0.0, 1_000.0));
        player.play();

        let out = render_all(&mut player, 16, 16);
        assert_abs_diff_eq!(out[0], 0.0);
        assert_abs_diff_eq!(out[2], 1.0);
        assert_abs_diff_eq!(out[3], 1.0); // mono duplicated to both channels
    }

    #[test]
    fn delay_offsets_the_start() {
        let mut player = RegionPlayer::new(48_000.0);
        player.attach();
        player.schedule(segment(ones_clip(48_000.0, 1_000), 8, 0.0, 1_000.0));
        player.play();

        let out = render_all(&mut player, 16, 16);
        assert_abs_diff_eq!(out[7 * 2], 0.0);
        assert_abs_diff_eq!(out[8 * 2], 1.0);
    }

    #[test]
    fn file_offset_reads_into_the_file() {
        let mut player = RegionPlayer::new(48_000.0);
        player.attach();
        player.schedule(segment(ramp_clip(48_000.0, 1_000), 0, 500.0, 100.0));
        player.play();

        let out = render_all(&mut player, 8, 8);
        assert_abs_diff_eq!(out[0], 500.0);
    }

    #[test]
    fn rate_mismatch_uses_file_frames_for_source_math() {
        // 24 kHz file on a 48 kHz player: each file frame spans two player
        // samples.
        let mut player = RegionPlayer::new(48_000.0);
        player.attach();
        player.schedule(segment(ramp_clip(24_000.0, 1_000), 0, 0.0, 100.0));
        player.play();

        let out = render_all(&mut player, 8, 8);
        assert_abs_diff_eq!(out[0], 0.0);
        assert_abs_diff_eq!(out[2], 0.5, epsilon = 1e-6); // halfway to frame 1
        assert_abs_diff_eq!(out[4], 1.0, epsilon = 1e-6);

        // 100 file frames at half rate occupy 200 player samples.
        let seg = segment(ramp_clip(24_000.0, 1_000), 0, 0.0, 100.0);
        assert_eq!(seg.length_samples(48_000.0), 200);
    }

    #[test]
    fn gap_between_segments_is_silent() {
        let mut player = RegionPlayer::new(48_000.0);
        player.attach();
        player.schedule(segment(ones_clip(48_000.0, 100), 0, 0.0, 4.0));
        player.schedule(segment(ones_clip(48_000.0, 100), 12, 0.0, 4.0));
        player.play();

        let out = render_all(&mut player, 16, 4);
        assert_abs_diff_eq!(out[3 * 2], 1.0);
        assert_abs_diff_eq!(out[4 * 2], 0.0);
        assert_abs_diff_eq!(out[11 * 2], 0.0);
        assert_abs_diff_eq!(out[12 * 2], 1.0);
    }

    #[test]
    fn schedule_while_playing_joins_at_offset() {
        let mut player = RegionPlayer::new(48_000.0);
        player.attach();
        player.play();

        let mut out = vec![0.0f32; 8];
        player.render(&mut out, 4); // clock at 4

        player.schedule(segment(ones_clip(48_000.0, 100), 6, 0.0, 10.0));
        let out = render_all(&mut player, 8, 8);
        // Player clock 4..12; the segment starts at absolute sample 6.
        assert_abs_diff_eq!(out[0], 0.0);
        assert_abs_diff_eq!(out[2 * 2], 1.0);
    }

    #[test]
    fn preserve_playback_keeps_the_clock() {
        let mut player = RegionPlayer::new(48_000.0);
        player.attach();
        player.schedule(segment(ones_clip(48_000.0, 100), 0, 0.0, 50.0));
        player.play();
        let mut out = vec![0.0f32; 32];
        player.render(&mut out, 16);
        assert_eq!(player.position(), 16);

        player.clear_schedule(true);
        assert!(player.is_playing());
        assert_eq!(player.position(), 16);

        player.clear_schedule(false);
        assert!(!player.is_playing());
        assert_eq!(player.position(), 0);
    }

    #[test]
    fn fades_ramp_the_edges() {
        let mut player = RegionPlayer::new(48_000.0);
        player.attach();
        let mut seg = segment(ones_clip(48_000.0, 1_000), 0, 0.0, 100.0);
        seg.fade_in_samples = 10;
        seg.fade_out_samples = 10;
        player.schedule(seg);
        player.play();

        let out = render_all(&mut player, 100, 25);
        assert_abs_diff_eq!(out[0], 0.0); // fade-in starts at zero
        assert!(out[5 * 2] > 0.4 && out[5 * 2] < 0.6);
        assert_abs_diff_eq!(out[50 * 2], 1.0); // steady middle
        assert!(out[95 * 2] < 0.6); // fading out
    }

    #[test]
    fn detached_player_is_silent() {
        let mut player = RegionPlayer::new(48_000.0);
        player.schedule(segment(ones_clip(48_000.0, 100), 0, 0.0, 50.0));
        player.play();
        let mut out = vec![0.0f32; 8];
        player.render(&mut out, 4);
        assert!(out.iter().all(|&s| s == 0.0));
    }
}
