use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pitchtrack", about = "Tracks the sung or played pitch of an audio file")]
pub struct Cli {
    /// Input audio file (WAV, MP3, FLAC, OGG, AAC)
    pub input: PathBuf,

    /// Config file (defaults to pitchtrack.toml or the user config dir)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// FFT window size in samples (power of two)
    #[arg(long, default_value_t = 4096)]
    pub window: usize,

    /// Hop between windows in samples
    #[arg(long, default_value_t = 1024)]
    pub step: usize,

    /// Lowest frequency analysed, in Hz
    #[arg(long, default_value_t = 45.0)]
    pub min_freq: f64,

    /// Highest frequency analysed, in Hz
    #[arg(long, default_value_t = 5000.0)]
    pub max_freq: f64,

    /// Start analysis this many seconds into the file
    #[arg(long, default_value_t = 0.0)]
    pub start: f64,

    /// Write the pitch track as JSON to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Guess the note sung between BEGIN:END seconds
    #[arg(long, value_parser = parse_span)]
    pub guess: Option<(f64, f64)>,

    /// Frequency band for --guess as LO:HI Hz
    #[arg(long, value_parser = parse_span)]
    pub range: Option<(f64, f64)>,
}

/// Parses `A:B` into an ordered pair.
fn parse_span(s: &str) -> Result<(f64, f64), String> {
    let (a, b) = s
        .split_once(':')
        .ok_or_else(|| format!("expected A:B, got {s:?}"))?;
    let a: f64 = a.trim().parse().map_err(|e| format!("{a:?}: {e}"))?;
    let b: f64 = b.trim().parse().map_err(|e| format!("{b:?}: {e}"))?;
    if !(a <= b) {
        return Err(format!("{a} must not be greater than {b}"));
    }
    Ok((a, b))
}
