//! Accumulated analysis output: the renderable pitch path plus the tone
//! detections that note guessing works from.

use serde::Serialize;

use super::tone::{freq_to_note, PitchFragment, TONE_MATCH_SEMITONES};

/// Time-ordered pitch fragments.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PitchPath {
    fragments: Vec<PitchFragment>,
}

impl PitchPath {
    pub fn fragments(&self) -> &[PitchFragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Appends a fragment; fragments must arrive in time order.
    pub fn push(&mut self, fragment: PitchFragment) {
        debug_assert!(self.fragments.last().map_or(true, |last| last.time <= fragment.time));
        self.fragments.push(fragment);
    }

    /// Fragments with `begin <= time <= end`.
    pub fn visible(&self, begin: f64, end: f64) -> &[PitchFragment] {
        let lo = self.fragments.partition_point(|f| f.time < begin);
        let hi = self.fragments.partition_point(|f| f.time <= end);
        &self.fragments[lo..hi.max(lo)]
    }

    fn truncate_from(&mut self, time: f64) {
        let keep = self.fragments.partition_point(|f| f.time < time);
        self.fragments.truncate(keep);
    }

    fn append(&mut self, other: &mut PitchPath) {
        debug_assert!(match (self.fragments.last(), other.fragments.first()) {
            (Some(last), Some(first)) => last.time <= first.time,
            _ => true,
        });
        self.fragments.append(&mut other.fragments);
    }
}

/// Maps between stream seconds and horizontal pixels of a note graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Time at pixel 0
    pub offset_s: f64,
    pub px_per_s: f64,
    pub width_px: f64,
}

impl Viewport {
    pub fn px2s(&self, px: f64) -> f64 {
        self.offset_s + px / self.px_per_s
    }

    pub fn s2px(&self, s: f64) -> f64 {
        (s - self.offset_s) * self.px_per_s
    }

    /// Time range covered by the viewport.
    pub fn time_range(&self) -> (f64, f64) {
        (self.px2s(0.0), self.px2s(self.width_px))
    }

    pub fn visible<'a>(&self, path: &'a PitchPath) -> &'a [PitchFragment] {
        let (begin, end) = self.time_range();
        path.visible(begin, end)
    }
}

/// A detected tone as copied out of the analysis thread.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    /// Index of the analysis window since the session started
    pub window: u64,
    pub time: f64,
    pub freq: f64,
    pub level: f64,
    /// Consecutive windows the tone had persisted for at this point
    pub age: u32,
}

/// Answer to a note-snapping query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoteGuess {
    /// MIDI note number
    pub note: i32,
    /// Frequency of the tone the guess was taken from
    pub freq: f64,
    /// Share of the windows in the queried range that carried this note
    pub confidence: f64,
}

/// Everything one analysis session produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PitchTrack {
    pub path: PitchPath,
    pub detections: Vec<Detection>,
    /// Start time of every analysed window, tones or not
    pub window_times: Vec<f64>,
}

impl PitchTrack {
    pub fn push_window(&mut self, time: f64) {
        self.window_times.push(time);
    }

    pub fn push_detection(&mut self, detection: Detection) {
        self.path.push(PitchFragment {
            time: detection.time,
            note: freq_to_note(detection.freq),
            level: detection.level,
        });
        self.detections.push(detection);
    }

    /// Moves everything in `other` to the end of this track.
    pub fn append(&mut self, other: &mut PitchTrack) {
        self.path.append(&mut other.path);
        self.detections.append(&mut other.detections);
        self.window_times.append(&mut other.window_times);
    }

    /// Drops everything at or after `time`, used when analysis restarts
    /// from an earlier position.
    pub fn truncate_from(&mut self, time: f64) {
        self.path.truncate_from(time);
        let keep = self.detections.partition_point(|d| d.time < time);
        self.detections.truncate(keep);
        let keep = self.window_times.partition_point(|&t| t < time);
        self.window_times.truncate(keep);
    }

    pub fn duration(&self) -> f64 {
        self.window_times.last().copied().unwrap_or(0.0)
    }

    fn detections_between(&self, begin: f64, end: f64) -> &[Detection] {
        let lo = self.detections.partition_point(|d| d.time < begin);
        let hi = self.detections.partition_point(|d| d.time <= end);
        &self.detections[lo..hi.max(lo)]
    }

    /// Best note for `[begin, end]` within the band `[min_freq, max_freq]`.
    ///
    /// Prefers the loudest tone that persisted for at least `min_stable`
    /// windows, falls back to the loudest tone in the band, and returns
    /// `None` when nothing was detected there.
    pub fn guess_note(
        &self,
        begin: f64,
        end: f64,
        (min_freq, max_freq): (f64, f64),
        min_stable: u32,
    ) -> Option<NoteGuess> {
        let candidates: Vec<&Detection> = self
            .detections_between(begin, end)
            .iter()
            .filter(|d| d.freq >= min_freq && d.freq <= max_freq)
            .collect();

        let best = loudest(candidates.iter().copied().filter(|d| d.age >= min_stable))
            .or_else(|| loudest(candidates.iter().copied()))?;

        let note = freq_to_note(best.freq).round() as i32;
        let mut hit_windows: Vec<u64> = candidates
            .iter()
            .filter(|d| (freq_to_note(d.freq) - note as f64).abs() < TONE_MATCH_SEMITONES)
            .map(|d| d.window)
            .collect();
        hit_windows.dedup();

        let lo = self.window_times.partition_point(|&t| t < begin);
        let hi = self.window_times.partition_point(|&t| t <= end);
        let windows = hi.saturating_sub(lo).max(1);

        Some(NoteGuess {
            note,
            freq: best.freq,
            confidence: (hit_windows.len() as f64 / windows as f64).min(1.0),
        })
    }
}

fn loudest<'a>(pool: impl Iterator<Item = &'a Detection>) -> Option<&'a Detection> {
    pool.max_by(|a, b| a.level.total_cmp(&b.level))
}
