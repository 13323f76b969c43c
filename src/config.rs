use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::AnalysisError;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub guess: GuessConfig,
}

/// Parameters of the spectral analysis.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisConfig {
    /// Rate every decoded stream is resampled to before analysis
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// FFT length, must be a power of two
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Hop between successive windows in samples
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    #[serde(default = "default_min_freq")]
    pub min_freq: f64,
    #[serde(default = "default_max_freq")]
    pub max_freq: f64,
    /// Absolute noise floor for a bin's linear level
    #[serde(default = "default_min_level")]
    pub min_level: f64,
    /// Bins further than this below the loudest bin are treated as noise
    #[serde(default = "default_dynamic_range_db")]
    pub dynamic_range_db: f64,
    #[serde(default = "default_max_combos")]
    pub max_combos: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Capacity in samples
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

/// Defaults for note guessing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuessConfig {
    #[serde(default = "default_guess_min_freq")]
    pub min_freq: f64,
    #[serde(default = "default_guess_max_freq")]
    pub max_freq: f64,
    #[serde(default = "default_min_stable_windows")]
    pub min_stable_windows: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            window_size: default_window_size(),
            step_size: default_step_size(),
            min_freq: default_min_freq(),
            max_freq: default_max_freq(),
            min_level: default_min_level(),
            dynamic_range_db: default_dynamic_range_db(),
            max_combos: default_max_combos(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

impl Default for GuessConfig {
    fn default() -> Self {
        Self {
            min_freq: default_guess_min_freq(),
            max_freq: default_guess_max_freq(),
            min_stable_windows: default_min_stable_windows(),
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), AnalysisError> {
        let invalid = |msg: String| Err(AnalysisError::InvalidConfig(msg));
        if self.sample_rate == 0 {
            return invalid("sample rate must be positive".into());
        }
        if self.window_size < 16 || !self.window_size.is_power_of_two() {
            return invalid(format!(
                "window size {} is not a power of two >= 16",
                self.window_size
            ));
        }
        if self.step_size == 0 || self.step_size > self.window_size {
            return invalid(format!(
                "step size {} must be in 1..={}",
                self.step_size, self.window_size
            ));
        }
        let nyquist = self.sample_rate as f64 / 2.0;
        if !(self.min_freq > 0.0 && self.min_freq < self.max_freq && self.max_freq <= nyquist) {
            return invalid(format!(
                "frequency range {}..{} Hz must be non-empty and below {} Hz",
                self.min_freq, self.max_freq, nyquist
            ));
        }
        if self.max_combos == 0 {
            return invalid("max_combos must be at least 1".into());
        }
        Ok(())
    }

    /// Seconds between two successive windows.
    pub fn step_seconds(&self) -> f64 {
        self.step_size as f64 / self.sample_rate as f64
    }
}

fn default_sample_rate() -> u32 { 44_100 }
fn default_window_size() -> usize { 4096 }
fn default_step_size() -> usize { 1024 }
fn default_min_freq() -> f64 { 45.0 }
fn default_max_freq() -> f64 { 5000.0 }
fn default_min_level() -> f64 { 1e-4 }
fn default_dynamic_range_db() -> f64 { 30.0 }
fn default_max_combos() -> usize { 30 }
fn default_queue_capacity() -> usize { 65_536 }
fn default_guess_min_freq() -> f64 { 70.0 }
fn default_guess_max_freq() -> f64 { 700.0 }
fn default_min_stable_windows() -> u32 { 3 }

pub fn load_config(path: &Path) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(cfg) => Some(cfg),
        Err(err) => {
            log::warn!("Invalid config {}: {}", path.display(), err);
            None
        }
    }
}
