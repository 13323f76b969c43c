//! Spectral building blocks: per-bin peaks, merged combos, reconstructed
//! tones and the per-window moments that hold them.

use serde::Serialize;

/// Relative tolerance for merging neighbouring peaks into one combo.
pub const COMBO_MATCH: f64 = 0.06;
/// Relative tolerance for accepting a combo as a harmonic of a fundamental.
pub const HARMONIC_MATCH: f64 = 0.03;
/// Relative tolerance for treating a tone as a multiple of a lower tone.
pub const DEDUP_MATCH: f64 = 0.02;
/// Tones closer than this (in semitones) are the same pitch.
pub const TONE_MATCH_SEMITONES: f64 = 0.5;

/// Number of harmonic slots kept per tone (index 0 is the fundamental).
pub const MAX_HARMONICS: usize = 16;

const A4_FREQ: f64 = 440.0;
const A4_NOTE: f64 = 69.0;
const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Frequency in Hz to a fractional MIDI note number.
pub fn freq_to_note(freq: f64) -> f64 {
    A4_NOTE + 12.0 * (freq / A4_FREQ).log2()
}

pub fn note_to_freq(note: f64) -> f64 {
    A4_FREQ * 2f64.powf((note - A4_NOTE) / 12.0)
}

/// Scientific pitch name of a MIDI note, e.g. 57 -> "A3".
pub fn note_name(note: i32) -> String {
    let name = NOTE_NAMES[note.rem_euclid(12) as usize];
    format!("{}{}", name, note.div_euclid(12) - 1)
}

/// True when `a` and `b` differ by less than `tolerance` relative to the lower one.
pub fn freq_matches(a: f64, b: f64, tolerance: f64) -> bool {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    lo > 0.0 && hi / lo - 1.0 < tolerance
}

/// Harmonic number of `freq` over `fundamental`, if it is an integer
/// multiple within `tolerance`.
pub fn harmonic_number(fundamental: f64, freq: f64, tolerance: f64) -> Option<usize> {
    if fundamental <= 0.0 {
        return None;
    }
    let ratio = freq / fundamental;
    let n = ratio.round();
    if n < 1.0 {
        return None;
    }
    ((ratio / n - 1.0).abs() < tolerance).then_some(n as usize)
}

/// One FFT bin after phase refinement.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Peak {
    /// Bin centre frequency
    pub freq_fft: f64,
    /// Phase-corrected frequency
    pub freq: f64,
    /// Linear magnitude normalised by the FFT length
    pub level: f64,
}

/// Adjacent peaks that agree on their frequency.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Combo {
    /// Level-weighted mean of the member peaks' frequencies
    pub freq: f64,
    pub level: f64,
}

impl Combo {
    pub fn from_peak(peak: &Peak) -> Self {
        Self {
            freq: peak.freq,
            level: peak.level,
        }
    }

    pub fn matches(&self, peak: &Peak) -> bool {
        freq_matches(self.freq, peak.freq, COMBO_MATCH)
    }

    pub fn combine(&mut self, peak: &Peak) {
        let level = self.level + peak.level;
        if level > 0.0 {
            self.freq = (self.freq * self.level + peak.freq * peak.level) / level;
        }
        self.level = level;
    }
}

/// Position of a tone inside a session's moment history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ToneRef {
    pub moment: usize,
    pub tone: usize,
}

/// A pitch hypothesis (fundamental plus harmonics) for one analysis window.
#[derive(Debug, Clone, PartialEq)]
pub struct Tone {
    pub freq: f64,
    /// Sum of the harmonic levels
    pub level: f64,
    pub harmonics: [f64; MAX_HARMONICS],
    /// Same tone in the previous moment
    pub prev: Option<ToneRef>,
    /// Same tone in the next moment
    pub next: Option<ToneRef>,
    /// Consecutive windows this tone has persisted, including this one
    pub age: u32,
}

impl Default for Tone {
    fn default() -> Self {
        Self {
            freq: 0.0,
            level: 0.0,
            harmonics: [0.0; MAX_HARMONICS],
            prev: None,
            next: None,
            age: 1,
        }
    }
}

impl Tone {
    pub fn note(&self) -> f64 {
        freq_to_note(self.freq)
    }

    /// Same pitch: within half a semitone. Not transitive.
    pub fn matches(&self, freq: f64) -> bool {
        self.freq > 0.0
            && freq > 0.0
            && (12.0 * (freq / self.freq).log2()).abs() < TONE_MATCH_SEMITONES
    }

    /// Number of harmonic slots carrying energy.
    pub fn harmonic_count(&self) -> usize {
        self.harmonics.iter().filter(|&&l| l > 0.0).count()
    }
}

/// All tones found in one analysis window, sorted by frequency.
#[derive(Debug, Clone, Default)]
pub struct Moment {
    /// Seconds from the start of the stream
    pub time: f64,
    pub tones: Vec<Tone>,
}

impl Moment {
    pub fn new(time: f64, mut tones: Vec<Tone>) -> Self {
        tones.sort_by(|a, b| a.freq.total_cmp(&b.freq));
        Self { time, tones }
    }

    pub fn is_sorted(&self) -> bool {
        self.tones.windows(2).all(|w| w[0].freq <= w[1].freq)
    }

    /// Index of the tone matching `freq`, closest in pitch first.
    pub fn find(&self, freq: f64) -> Option<usize> {
        self.tones
            .iter()
            .enumerate()
            .filter(|(_, t)| t.matches(freq))
            .min_by(|(_, a), (_, b)| {
                (a.freq / freq).ln().abs().total_cmp(&(b.freq / freq).ln().abs())
            })
            .map(|(i, _)| i)
    }
}

/// Render-only sample of the pitch path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PitchFragment {
    pub time: f64,
    /// Fractional MIDI note
    pub note: f64,
    pub level: f64,
}
