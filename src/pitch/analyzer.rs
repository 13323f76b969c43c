//! FFT-based tone detection for one window of samples at a time.
//!
//! Each call to [`SpectralAnalyzer::process`] windows the samples, refines
//! every bin's frequency from the phase advance since the previous window,
//! merges agreeing bins into combos and rebuilds harmonic tones from them,
//! including fundamentals that are weak or missing from the spectrum.

use std::f64::consts::{PI, TAU};
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::tone::{
    harmonic_number, Combo, Peak, Tone, DEDUP_MATCH, HARMONIC_MATCH, MAX_HARMONICS,
};
use crate::config::AnalysisConfig;
use crate::error::AnalysisError;

/// Largest divisor tried when looking for a missing fundamental.
pub const MAX_DIVISOR: usize = 3;
/// Harmonics needed before a divided-down fundamental is believed.
pub const MIN_SUBHARMONIC_SUPPORT: usize = 3;
/// A multiple of a lower tone survives only if it is this much louder.
pub const DEDUP_LEVEL_RATIO: f64 = 2.0;

pub struct SpectralAnalyzer {
    config: AnalysisConfig,
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
    last_phase: Vec<f64>,
    primed: bool,
    k_min: usize,
    k_max: usize,
}

impl SpectralAnalyzer {
    pub fn new(config: AnalysisConfig) -> Result<Self, AnalysisError> {
        config.validate()?;
        let n = config.window_size;
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(n);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        let freq_per_bin = config.sample_rate as f64 / n as f64;
        // One bin of slack either side: refinement may move a bin by up to one bin width
        let k_min = ((config.min_freq / freq_per_bin).floor() as usize)
            .saturating_sub(1)
            .max(1);
        let k_max = ((config.max_freq / freq_per_bin).ceil() as usize + 1).min(n / 2 - 1);

        Ok(Self {
            fft,
            window: hamming_window(n),
            buffer: vec![Complex::new(0.0, 0.0); n],
            scratch,
            last_phase: vec![0.0; n / 2 + 1],
            primed: false,
            k_min,
            k_max,
            config,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Forgets the phase history; the next window only primes it again.
    pub fn reset(&mut self) {
        self.last_phase.iter_mut().for_each(|p| *p = 0.0);
        self.primed = false;
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Analyses one window of exactly `window_size` samples.
    ///
    /// Returns the detected tones sorted by frequency, all within the
    /// configured frequency range. The first window after construction or
    /// [`reset`](Self::reset) has no phase reference and yields no tones.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<Tone>, AnalysisError> {
        let n = self.config.window_size;
        if samples.len() != n {
            return Err(AnalysisError::WindowSize {
                expected: n,
                got: samples.len(),
            });
        }

        for ((slot, &s), &w) in self.buffer.iter_mut().zip(samples).zip(&self.window) {
            *slot = Complex::new(s as f64 * w, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let peaks = self.refine_peaks();
        if !self.primed {
            self.primed = true;
            return Ok(Vec::new());
        }

        let combos = strongest_combos(combine_peaks(&peaks), self.config.max_combos);
        let tones = reconstruct_tones(&combos)
            .into_iter()
            .filter(|t| t.freq >= self.config.min_freq && t.freq <= self.config.max_freq)
            .collect();
        Ok(dedup_tones(tones))
    }

    /// Phase-refines every bin in range and keeps the plausible ones.
    fn refine_peaks(&mut self) -> Vec<Peak> {
        let n = self.config.window_size as f64;
        let freq_per_bin = self.config.sample_rate as f64 / n;
        let phase_step = TAU * self.config.step_size as f64 / n;
        let norm = 1.0 / n;

        let mut candidates = Vec::with_capacity(self.k_max - self.k_min + 1);
        let mut loudest = 0.0f64;
        for k in self.k_min..=self.k_max {
            let c = self.buffer[k];
            let level = c.norm() * norm;
            let phase = c.arg();
            let expected = k as f64 * phase_step;
            let delta = wrap_phase(phase - self.last_phase[k] - expected);
            self.last_phase[k] = phase;

            let freq = (k as f64 + delta / phase_step) * freq_per_bin;
            loudest = loudest.max(level);
            candidates.push(Peak {
                freq_fft: k as f64 * freq_per_bin,
                freq,
                level,
            });
        }

        let floor = self
            .config
            .min_level
            .max(loudest * 10f64.powf(-self.config.dynamic_range_db / 20.0));
        let (min_freq, max_freq) = (self.config.min_freq, self.config.max_freq);
        candidates.retain(|p| {
            p.level > floor
                && p.freq >= min_freq
                && p.freq <= max_freq
                && (p.freq - p.freq_fft).abs() <= freq_per_bin
        });
        candidates
    }
}

/// Wraps a phase into (-PI, PI].
fn wrap_phase(phase: f64) -> f64 {
    let wrapped = phase - TAU * (phase / TAU).round();
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

fn hamming_window(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.54 - 0.46 * (TAU * i as f64 / (size - 1) as f64).cos())
        .collect()
}

/// Merges consecutive peaks whose refined frequencies agree.
pub fn combine_peaks(peaks: &[Peak]) -> Vec<Combo> {
    let mut combos: Vec<Combo> = Vec::new();
    for peak in peaks {
        match combos.last_mut() {
            Some(combo) if combo.matches(peak) => combo.combine(peak),
            _ => combos.push(Combo::from_peak(peak)),
        }
    }
    combos
}

/// Keeps the `max` loudest combos, returned in frequency order.
pub fn strongest_combos(mut combos: Vec<Combo>, max: usize) -> Vec<Combo> {
    if combos.len() > max {
        combos.select_nth_unstable_by(max - 1, |a, b| b.level.total_cmp(&a.level));
        combos.truncate(max);
    }
    combos.sort_by(|a, b| a.freq.total_cmp(&b.freq));
    combos
}

/// Builds tone hypotheses from combos sorted by frequency.
///
/// Every combo is tried as harmonic 1, 2 and 3 of a fundamental. Combos at
/// or above it that sit on an integer multiple of that fundamental add their
/// level to the matching harmonic slot. A divided-down fundamental needs at
/// least [`MIN_SUBHARMONIC_SUPPORT`] harmonics, one of them off the series
/// of the combo it was divided from.
///
/// # Panics
/// If `combos` is not sorted by frequency.
pub fn reconstruct_tones(combos: &[Combo]) -> Vec<Tone> {
    assert!(
        combos.windows(2).all(|w| w[0].freq <= w[1].freq),
        "combos must be sorted by frequency before harmonic matching"
    );

    let limit = MAX_HARMONICS as f64 * (1.0 + HARMONIC_MATCH);
    let mut tones = Vec::new();
    for (c, base) in combos.iter().enumerate() {
        for div in 1..=MAX_DIVISOR {
            let fundamental = base.freq / div as f64;
            let mut tone = Tone::default();
            let mut weighted = 0.0;
            let mut support = 0;
            let mut independent = false;

            for combo in &combos[c..] {
                if combo.freq / fundamental > limit {
                    break;
                }
                let n = match harmonic_number(fundamental, combo.freq, HARMONIC_MATCH) {
                    Some(n) if n <= MAX_HARMONICS => n,
                    _ => continue,
                };
                tone.harmonics[n - 1] += combo.level;
                tone.level += combo.level;
                weighted += combo.freq / n as f64 * combo.level;
                support += 1;
                independent |= n % div != 0;
            }

            if div > 1 && (support < MIN_SUBHARMONIC_SUPPORT || !independent) {
                continue;
            }
            if tone.level <= 0.0 {
                continue;
            }
            tone.freq = weighted / tone.level;
            tones.push(tone);
        }
    }
    tones.sort_by(|a, b| a.freq.total_cmp(&b.freq));
    tones
}

/// Drops tones that are harmonics of a lower tone which is not much weaker.
///
/// Near-identical tones (the same fundamental reached from different
/// combos) collapse into the louder one.
pub fn dedup_tones(mut tones: Vec<Tone>) -> Vec<Tone> {
    tones.sort_by(|a, b| a.freq.total_cmp(&b.freq));
    let mut kept: Vec<Tone> = Vec::with_capacity(tones.len());
    'next: for tone in tones {
        for lower in kept.iter_mut() {
            match harmonic_number(lower.freq, tone.freq, DEDUP_MATCH) {
                Some(1) => {
                    if tone.level > lower.level {
                        *lower = tone;
                    }
                    continue 'next;
                }
                Some(_) if tone.level < DEDUP_LEVEL_RATIO * lower.level => continue 'next,
                _ => {}
            }
        }
        kept.push(tone);
    }
    kept.sort_by(|a, b| a.freq.total_cmp(&b.freq));
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 44_100;

    fn sines(partials: &[(f64, f64)], len: usize, offset: usize) -> Vec<f32> {
        (offset..offset + len)
            .map(|i| {
                let t = i as f64 / RATE as f64;
                partials
                    .iter()
                    .map(|&(f, a)| a * (TAU * f * t).sin())
                    .sum::<f64>() as f32
            })
            .collect()
    }

    /// Runs the analyzer over a sustained signal, skipping the priming window.
    fn analyze(
        partials: &[(f64, f64)],
        config: AnalysisConfig,
        windows: usize,
    ) -> Vec<Vec<Tone>> {
        let mut analyzer = SpectralAnalyzer::new(config.clone()).unwrap();
        let signal = sines(
            partials,
            config.window_size + config.step_size * windows,
            0,
        );
        let mut out = Vec::new();
        for w in 0..=windows {
            let start = w * config.step_size;
            let tones = analyzer
                .process(&signal[start..start + config.window_size])
                .unwrap();
            if w > 0 {
                out.push(tones);
            }
        }
        out
    }

    fn combo(freq: f64, level: f64) -> Combo {
        Combo { freq, level }
    }

    fn tone(freq: f64, level: f64) -> Tone {
        Tone { freq, level, ..Default::default() }
    }

    #[test]
    fn test_wrap_phase() {
        assert!((wrap_phase(0.5) - 0.5).abs() < 1e-12);
        assert!((wrap_phase(PI + 0.1) - (-PI + 0.1)).abs() < 1e-9);
        assert!((wrap_phase(-PI - 0.1) - (PI - 0.1)).abs() < 1e-9);
        assert!((wrap_phase(-PI) - PI).abs() < 1e-9);
        assert!((wrap_phase(10.0 * PI + 0.5) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_wrong_window_length_is_rejected() {
        let mut analyzer = SpectralAnalyzer::new(AnalysisConfig::default()).unwrap();
        let err = analyzer.process(&[0.0; 100]).unwrap_err();
        assert_eq!(err, AnalysisError::WindowSize { expected: 4096, got: 100 });
    }

    #[test]
    fn test_first_window_only_primes() {
        let mut analyzer = SpectralAnalyzer::new(AnalysisConfig::default()).unwrap();
        let signal = sines(&[(440.0, 0.5)], 4096, 0);
        assert!(analyzer.process(&signal).unwrap().is_empty());
        assert!(analyzer.is_primed());
        analyzer.reset();
        assert!(!analyzer.is_primed());
    }

    #[test]
    fn test_silence_yields_nothing() {
        let mut analyzer = SpectralAnalyzer::new(AnalysisConfig::default()).unwrap();
        let silence = vec![0.0f32; 4096];
        analyzer.process(&silence).unwrap();
        assert!(analyzer.process(&silence).unwrap().is_empty());
    }

    #[test]
    fn test_pure_sine_refines_within_one_percent() {
        for &freq in &[110.0, 220.0, 261.63, 440.0, 987.0] {
            let frames = analyze(&[(freq, 0.5)], AnalysisConfig::default(), 8);
            for tones in frames {
                assert_eq!(tones.len(), 1, "{} Hz: expected one tone, got {:?}", freq, tones);
                let err = (tones[0].freq / freq - 1.0).abs();
                assert!(err < 0.01, "{} Hz detected as {:.2} Hz", freq, tones[0].freq);
            }
        }
    }

    #[test]
    fn test_missing_fundamental_is_reconstructed() {
        let f = 150.0;
        let frames = analyze(
            &[(2.0 * f, 0.3), (3.0 * f, 0.3), (4.0 * f, 0.3)],
            AnalysisConfig::default(),
            4,
        );
        for tones in frames {
            assert!(
                tones.iter().any(|t| (t.freq / f - 1.0).abs() < 0.03),
                "expected a reconstructed {} Hz tone in {:?}",
                f,
                tones.iter().map(|t| t.freq).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_two_harmonics_do_not_imply_a_fundamental() {
        let f = 150.0;
        let frames = analyze(&[(2.0 * f, 0.3), (3.0 * f, 0.3)], AnalysisConfig::default(), 4);
        for tones in frames {
            assert!(
                tones.iter().all(|t| (t.freq / f - 1.0).abs() >= 0.03),
                "no {} Hz tone expected in {:?}",
                f,
                tones.iter().map(|t| t.freq).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_harmonic_voice_is_not_split_an_octave_down() {
        let f = 196.0;
        let partials: Vec<(f64, f64)> = (1..=5).map(|n| (f * n as f64, 0.15)).collect();
        let frames = analyze(&partials, AnalysisConfig::default(), 4);
        for tones in frames {
            assert_eq!(tones.len(), 1, "{:?}", tones.iter().map(|t| t.freq).collect::<Vec<_>>());
            assert!((tones[0].freq / f - 1.0).abs() < 0.01);
            assert!(tones[0].harmonic_count() >= 5);
        }
    }

    #[test]
    fn test_tones_stay_in_range_for_all_window_shapes() {
        let partials = [(60.0, 0.2), (233.0, 0.3), (1210.0, 0.2), (4900.0, 0.1), (7000.0, 0.2)];
        for &window_size in &[1024usize, 2048, 4096, 8192] {
            for &step_size in &[window_size / 4, window_size / 8] {
                let config = AnalysisConfig {
                    window_size,
                    step_size,
                    min_freq: 100.0,
                    max_freq: 2000.0,
                    ..Default::default()
                };
                for tones in analyze(&partials, config.clone(), 3) {
                    for t in &tones {
                        assert!(
                            t.freq >= config.min_freq && t.freq <= config.max_freq,
                            "N={} S={}: tone {:.1} Hz out of range",
                            window_size,
                            step_size,
                            t.freq
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_strongest_combos_keeps_loudest_in_frequency_order() {
        let combos = vec![
            combo(100.0, 0.1),
            combo(200.0, 0.9),
            combo(300.0, 0.2),
            combo(400.0, 0.8),
            combo(500.0, 0.5),
        ];
        let kept = strongest_combos(combos, 3);
        let freqs: Vec<f64> = kept.iter().map(|c| c.freq).collect();
        assert_eq!(freqs, vec![200.0, 400.0, 500.0]);
    }

    #[test]
    fn test_combine_peaks_merges_neighbours() {
        let peaks = [
            Peak { freq_fft: 215.3, freq: 220.1, level: 0.1 },
            Peak { freq_fft: 226.1, freq: 219.9, level: 0.1 },
            Peak { freq_fft: 441.4, freq: 440.0, level: 0.05 },
        ];
        let combos = combine_peaks(&peaks);
        assert_eq!(combos.len(), 2);
        assert!((combos[0].freq - 220.0).abs() < 1e-9);
        assert!((combos[0].level - 0.2).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "sorted by frequency")]
    fn test_unsorted_combos_fail_loudly() {
        reconstruct_tones(&[combo(300.0, 1.0), combo(200.0, 1.0)]);
    }

    #[test]
    fn test_reconstruct_missing_fundamental_from_combos() {
        let tones = reconstruct_tones(&[combo(300.0, 1.0), combo(450.0, 1.0), combo(600.0, 1.0)]);
        let fundamental = tones
            .iter()
            .find(|t| (t.freq - 150.0).abs() < 1.0)
            .expect("150 Hz hypothesis");
        assert_eq!(fundamental.harmonics[1], 1.0);
        assert_eq!(fundamental.harmonics[2], 1.0);
        assert_eq!(fundamental.harmonics[3], 1.0);
        assert_eq!(fundamental.harmonics[0], 0.0);

        let deduped = dedup_tones(tones);
        assert_eq!(deduped.len(), 1);
        assert!((deduped[0].freq - 150.0).abs() < 1.0);
    }

    #[test]
    fn test_dedup_removes_weaker_octave() {
        let kept = dedup_tones(vec![tone(220.0, 1.0), tone(440.0, 1.9)]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].freq, 220.0);
    }

    #[test]
    fn test_dedup_keeps_much_louder_octave() {
        let kept = dedup_tones(vec![tone(220.0, 1.0), tone(440.0, 2.5)]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_dedup_collapses_duplicates_to_louder() {
        let kept = dedup_tones(vec![tone(150.0, 3.0), tone(150.5, 4.0), tone(330.0, 1.0)]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].level, 4.0);
    }
}
