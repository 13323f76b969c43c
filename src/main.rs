mod cli;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io::BufWriter;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cli::Cli;
use pitchtrack::config::{self, Config};
use pitchtrack::pitch::{note_name, AnalysisSummary, NoteGuess, PitchTrack, PitchTrackDriver};

#[derive(Serialize)]
struct Report<'a> {
    summary: AnalysisSummary,
    guess: Option<NoteGuess>,
    track: &'a PitchTrack,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut cli = Cli::parse();

    // Load config: explicit --config path, or auto-detect pitchtrack.toml / global config
    let config_path = cli.config.clone().or_else(|| {
        let local = std::path::PathBuf::from("pitchtrack.toml");
        if local.exists() {
            return Some(local);
        }
        if let Some(home) = dirs::home_dir() {
            let xdg = home.join(".config").join("pitchtrack").join("config.toml");
            if xdg.exists() {
                return Some(xdg);
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            let platform = config_dir.join("pitchtrack").join("config.toml");
            if platform.exists() {
                return Some(platform);
            }
        }
        None
    });
    let mut config = Config::default();
    if let Some(ref path) = config_path {
        if let Some(cfg) = config::load_config(path) {
            log::info!("Loaded config from {}", path.display());
            // Merge: config values apply only when CLI is at its default
            if cli.window == 4096 { cli.window = cfg.analysis.window_size; }
            if cli.step == 1024 { cli.step = cfg.analysis.step_size; }
            if cli.min_freq == 45.0 { cli.min_freq = cfg.analysis.min_freq; }
            if cli.max_freq == 5000.0 { cli.max_freq = cfg.analysis.max_freq; }
            config = cfg;
        } else {
            log::warn!("Failed to load config from {}", path.display());
        }
    }
    config.analysis.window_size = cli.window;
    config.analysis.step_size = cli.step;
    config.analysis.min_freq = cli.min_freq;
    config.analysis.max_freq = cli.max_freq;
    let range = cli
        .range
        .unwrap_or((config.guess.min_freq, config.guess.max_freq));

    if !cli.input.exists() {
        anyhow::bail!("Input file not found: {}", cli.input.display());
    }

    log::info!("pitchtrack - pitch tracking for audio files");
    log::info!("Input: {}", cli.input.display());
    log::info!(
        "Window: {} samples, step: {} samples, band: {}-{} Hz",
        cli.window, cli.step, cli.min_freq, cli.max_freq
    );

    let driver = Arc::new(PitchTrackDriver::new(config).context("Invalid analysis settings")?);

    let worker = {
        let driver = Arc::clone(&driver);
        let input = cli.input.clone();
        let (step, start) = (cli.step, cli.start);
        thread::Builder::new()
            .name("pitch-analysis".into())
            .spawn(move || driver.analyze_from(&input, step, start))
            .context("Failed to start analysis thread")?
    };

    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(100));
    let bar_style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} windows ({eta} remaining)")?
        .progress_chars("=>-");
    while !worker.is_finished() {
        let (done, total) = driver.progress();
        if total > 0 && pb.length() != Some(total) {
            pb.set_style(bar_style.clone());
            pb.set_length(total);
        }
        pb.set_position(done);
        thread::sleep(Duration::from_millis(50));
    }

    let summary = worker
        .join()
        .map_err(|_| anyhow!("Analysis thread panicked"))?
        .with_context(|| format!("Failed to analyze {}", cli.input.display()))?;
    pb.finish_with_message("Analysis complete");

    let track = driver.committed();
    log::info!(
        "Analyzed {} windows, {} pitch fragments over {:.1}s",
        summary.windows, summary.fragments, summary.duration
    );
    match median_note(&track) {
        Some(note) => log::info!("Median pitch: {}", note_name(note)),
        None => log::info!("No pitch detected"),
    }

    let guess = cli.guess.and_then(|(begin, end)| {
        let guess = driver.guess_note(begin, end, range);
        match guess {
            Some(g) => println!(
                "{:.2}s-{:.2}s: {} ({:.1} Hz, confidence {:.0}%)",
                begin,
                end,
                note_name(g.note),
                g.freq,
                g.confidence * 100.0
            ),
            None => println!("{:.2}s-{:.2}s: no pitch detected", begin, end),
        }
        guess
    });

    if let Some(ref output) = cli.output {
        let file = std::fs::File::create(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        let report = Report {
            summary,
            guess,
            track: &track,
        };
        serde_json::to_writer_pretty(BufWriter::new(file), &report)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        log::info!("Done! Output: {}", output.display());
    }
    Ok(())
}

/// Median of the rounded fragment notes.
fn median_note(track: &PitchTrack) -> Option<i32> {
    let mut notes: Vec<i32> = track
        .path
        .fragments()
        .iter()
        .map(|f| f.note.round() as i32)
        .collect();
    if notes.is_empty() {
        return None;
    }
    let mid = notes.len() / 2;
    Some(*notes.select_nth_unstable(mid).1)
}
