//! Moment history for one analysis pass and the links that chain a tone
//! across successive windows.

use super::analyzer::SpectralAnalyzer;
use super::tone::{Moment, Tone, ToneRef};
use crate::config::AnalysisConfig;
use crate::error::AnalysisError;

/// Owns the analyzer and every moment it produced during one pass.
///
/// Tones refer to their neighbours through [`ToneRef`] indices into the
/// history, so nothing holds a reference into another moment.
pub struct AnalyzerSession {
    analyzer: SpectralAnalyzer,
    moments: Vec<Moment>,
    /// First moment of the current uninterrupted stretch; earlier moments
    /// are never linked to later ones
    segment_start: usize,
    /// Stream position (samples) of the next window
    position: u64,
}

impl AnalyzerSession {
    pub fn new(config: AnalysisConfig) -> Result<Self, AnalysisError> {
        Ok(Self {
            analyzer: SpectralAnalyzer::new(config)?,
            moments: Vec::new(),
            segment_start: 0,
            position: 0,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        self.analyzer.config()
    }

    pub fn moments(&self) -> &[Moment] {
        &self.moments
    }

    /// Stream time (seconds) of the next window.
    pub fn next_time(&self) -> f64 {
        self.position as f64 / self.config().sample_rate as f64
    }

    /// Starts a new stretch at stream position `position` (in samples),
    /// e.g. after a seek. Phase history is dropped and no tone of the new
    /// stretch links back to the old one.
    pub fn restart(&mut self, position: u64) {
        self.analyzer.reset();
        self.segment_start = self.moments.len();
        self.position = position;
    }

    /// Discards the whole history and starts over at position 0.
    pub fn clear(&mut self) {
        self.moments.clear();
        self.restart(0);
    }

    /// Analyses the next window, links it to the previous moment and
    /// appends it to the history.
    pub fn feed(&mut self, window: &[f32]) -> Result<&Moment, AnalysisError> {
        let time = self.next_time();
        let tones = self.analyzer.process(window)?;
        self.position += self.config().step_size as u64;

        let mut moment = Moment::new(time, tones);
        self.link(&mut moment);
        self.moments.push(moment);
        let last = self.moments.len() - 1;
        Ok(&self.moments[last])
    }

    /// Pairs each tone of `moment` with at most one matching tone of the
    /// previous moment, closest pitch first.
    fn link(&mut self, moment: &mut Moment) {
        let index = self.moments.len();
        if index == 0 || index <= self.segment_start {
            return;
        }
        let prev = &mut self.moments[index - 1];
        assert!(
            moment.is_sorted() && prev.is_sorted(),
            "moments must be sorted by frequency before linking"
        );

        let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
        for (i, tone) in moment.tones.iter().enumerate() {
            for (j, old) in prev.tones.iter().enumerate() {
                if old.matches(tone.freq) {
                    pairs.push(((tone.freq / old.freq).ln().abs(), i, j));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        for (_, i, j) in pairs {
            if moment.tones[i].prev.is_some() || prev.tones[j].next.is_some() {
                continue;
            }
            moment.tones[i].prev = Some(ToneRef { moment: index - 1, tone: j });
            moment.tones[i].age = prev.tones[j].age + 1;
            prev.tones[j].next = Some(ToneRef { moment: index, tone: i });
        }
    }

    pub fn tone(&self, r: ToneRef) -> Option<&Tone> {
        self.moments.get(r.moment)?.tones.get(r.tone)
    }

    /// First tone of the chain `r` belongs to.
    pub fn chain_start(&self, mut r: ToneRef) -> ToneRef {
        while let Some(prev) = self.tone(r).and_then(|t| t.prev) {
            r = prev;
        }
        r
    }

    /// Seconds from the first to the last window of the chain through `r`.
    pub fn duration_of(&self, r: ToneRef) -> f64 {
        let start = self.chain_start(r);
        let mut end = r;
        while let Some(next) = self.tone(end).and_then(|t| t.next) {
            end = next;
        }
        self.moments[end.moment].time - self.moments[start.moment].time
    }
}
