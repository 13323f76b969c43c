//! End-to-end tests: synthesised WAV files through decode, queue and analysis.

use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pitchtrack::config::Config;
use pitchtrack::error::PitchError;
use pitchtrack::pitch::{AnalysisSummary, PitchTrack, PitchTrackDriver};

/// Writes a 16-bit WAV of `seconds` length whose every channel carries `signal(t)`.
fn write_wav(
    name: &str,
    channels: u16,
    sample_rate: u32,
    seconds: f64,
    signal: impl Fn(f64) -> f64,
) -> PathBuf {
    let path = std::env::temp_dir()
        .join(format!("pitchtrack-{}-{}.wav", std::process::id(), name));
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).expect("Failed to create WAV fixture");
    let frames = (seconds * sample_rate as f64).round() as usize;
    for i in 0..frames {
        let s = (signal(i as f64 / sample_rate as f64) * i16::MAX as f64) as i16;
        for _ in 0..channels {
            writer.write_sample(s).unwrap();
        }
    }
    writer.finalize().unwrap();
    path
}

fn sine(freq: f64) -> impl Fn(f64) -> f64 {
    move |t| 0.5 * (TAU * freq * t).sin()
}

fn median_note(track: &PitchTrack) -> f64 {
    let mut notes: Vec<f64> = track.path.fragments().iter().map(|f| f.note).collect();
    assert!(!notes.is_empty(), "no fragments detected");
    notes.sort_by(|a, b| a.total_cmp(b));
    notes[notes.len() / 2]
}

#[test]
fn test_220hz_tone_end_to_end() {
    let path = write_wav("a3", 1, 44_100, 1.0, sine(220.0));
    let driver = PitchTrackDriver::new(Config::default()).unwrap();

    let summary = driver.analyze(&path, 1024).expect("Analysis should succeed");
    assert!(!summary.cancelled);
    assert_eq!(summary.windows, 40);
    assert_eq!(driver.progress(), (40, 40));

    let track = driver.committed();
    assert!(summary.fragments >= 30, "only {} fragments", summary.fragments);
    for fragment in track.path.fragments() {
        assert!(
            (fragment.note - 57.0).abs() < 0.5,
            "fragment at {:.3}s reports note {:.2}",
            fragment.time,
            fragment.note
        );
    }

    let guess = driver
        .guess_note(0.0, 1.0, (70.0, 700.0))
        .expect("A3 should be guessed");
    assert_eq!(guess.note, 57);
    assert!((guess.freq / 220.0 - 1.0).abs() < 0.01, "freq {}", guess.freq);
    assert!(guess.confidence > 0.8, "confidence {}", guess.confidence);

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_stereo_48k_is_downmixed_and_resampled() {
    let path = write_wav("e4-stereo", 2, 48_000, 1.0, sine(330.0));
    let driver = PitchTrackDriver::new(Config::default()).unwrap();

    let summary = driver.analyze(&path, 1024).expect("Analysis should succeed");
    assert!(
        (38..=42).contains(&summary.windows),
        "{} windows for one second",
        summary.windows
    );
    let note = median_note(&driver.committed());
    assert!((note - 64.0).abs() < 0.5, "median note {note:.2}");

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_start_offset_skips_earlier_audio() {
    let path = write_wav("a3-a4", 1, 44_100, 2.0, |t| {
        if t < 1.0 {
            sine(220.0)(t)
        } else {
            sine(440.0)(t)
        }
    });
    let driver = PitchTrackDriver::new(Config::default()).unwrap();

    driver
        .analyze_from(&path, 1024, 1.0)
        .expect("Analysis should succeed");
    let track = driver.committed();
    assert!(track.window_times.first().is_some_and(|&t| (t - 1.0).abs() < 1e-3));
    assert!(track.path.fragments().iter().all(|f| f.time >= 1.0 - 1e-3));
    let note = median_note(&track);
    assert!((note - 69.0).abs() < 0.5, "median note {note:.2}");
    assert_eq!(driver.guess_note(0.0, 0.9, (70.0, 700.0)), None);

    std::fs::remove_file(&path).ok();
}

/// Config with a small queue so decoding stays close behind analysis.
fn lockstep_config() -> Config {
    let mut config = Config::default();
    config.queue.capacity = 8192;
    config
}

/// Starts `analyze` on a thread and waits until `windows` windows are done.
fn start_analysis(
    driver: &Arc<PitchTrackDriver>,
    path: &Path,
    windows: u64,
) -> thread::JoinHandle<Result<AnalysisSummary, PitchError>> {
    let worker = {
        let driver = Arc::clone(driver);
        let path = path.to_path_buf();
        thread::spawn(move || driver.analyze(&path, 1024))
    };
    let deadline = Instant::now() + Duration::from_secs(30);
    while driver.progress().0 < windows && !worker.is_finished() {
        assert!(Instant::now() < deadline, "analysis made no progress");
        thread::sleep(Duration::from_millis(1));
    }
    worker
}

#[test]
fn test_cancel_keeps_fragments_so_far() {
    let path = write_wav("long", 1, 44_100, 60.0, sine(220.0));
    let driver = Arc::new(PitchTrackDriver::new(lockstep_config()).unwrap());

    let worker = start_analysis(&driver, &path, 10);
    assert!(driver.is_running(), "a minute of audio should still be analysing");
    assert!(matches!(driver.analyze(&path, 1024), Err(PitchError::Busy)));
    let before = driver.snapshot();
    driver.cancel();

    let summary = worker.join().unwrap().expect("Cancelled analysis is not an error");
    assert!(summary.cancelled);
    let (_, total) = driver.progress();
    assert!(
        summary.windows < total / 2,
        "{} of {} windows analysed after cancel",
        summary.windows,
        total
    );
    let track = driver.committed();
    assert_eq!(track.path.len(), summary.fragments);
    assert!(track.path.len() >= before.path.len());
    assert_eq!(
        &track.path.fragments()[..before.path.len()],
        before.path.fragments(),
        "fragments produced before the cancel must survive it"
    );
    assert!(!driver.is_running());

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_seek_restarts_analysis_at_target() {
    let path = write_wav("seek", 1, 44_100, 30.0, |t| {
        if t < 15.0 {
            sine(220.0)(t)
        } else {
            sine(440.0)(t)
        }
    });
    let driver = Arc::new(PitchTrackDriver::new(lockstep_config()).unwrap());

    let worker = start_analysis(&driver, &path, 5);
    let reached = driver.snapshot().duration();
    assert!(driver.seek(20.0), "seek must be accepted while analysing");

    let summary = worker.join().unwrap().expect("Seek is not an error");
    assert!(!summary.cancelled);
    let track = driver.committed();

    // Only what was queued before the seek may precede the target
    let gap_start = reached + 1.0;
    for f in track.path.fragments() {
        assert!(
            f.time <= gap_start || f.time >= 20.0 - 1e-3,
            "fragment at {:.3}s sits between {:.3}s and the seek target",
            f.time,
            gap_start
        );
    }
    assert!(track.window_times.windows(2).all(|w| w[0] < w[1]));

    // The first window after the seek primes, the next starts fresh chains
    let first = track
        .window_times
        .iter()
        .position(|&t| t >= 20.0 - 1e-3)
        .expect("windows after the seek target");
    assert!((track.window_times[first] - 20.0).abs() < 1e-3);
    let after: Vec<_> = track.detections.iter().filter(|d| d.time >= 20.0 - 1e-3).collect();
    assert!(!after.is_empty());
    assert!(after[0].time > track.window_times[first]);
    assert!(
        after
            .iter()
            .filter(|d| d.time == after[0].time)
            .all(|d| d.age == 1),
        "no tone may link across a seek"
    );
    assert!(after.iter().all(|d| (d.freq / 440.0 - 1.0).abs() < 0.03));

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_seek_past_end_finishes_normally() {
    let path = write_wav("seek-past-end", 1, 44_100, 30.0, sine(220.0));
    let driver = Arc::new(PitchTrackDriver::new(lockstep_config()).unwrap());

    let worker = start_analysis(&driver, &path, 5);
    let before = driver.snapshot();
    assert!(driver.seek(45.0), "seek must be accepted while analysing");

    let summary = worker
        .join()
        .unwrap()
        .expect("Seeking past the end is not an error");
    assert!(!summary.cancelled);
    let track = driver.committed();
    assert!(track.path.len() >= before.path.len());
    assert!(!track.path.is_empty());
    assert_eq!(
        &track.path.fragments()[..before.path.len()],
        before.path.fragments()
    );
    assert!(track.path.fragments().iter().all(|f| f.time < 30.0));

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_failed_session_keeps_previous_track() {
    let good = write_wav("good", 1, 44_100, 1.0, sine(220.0));
    let bad = std::env::temp_dir().join(format!("pitchtrack-{}-bad.wav", std::process::id()));
    std::fs::write(&bad, b"definitely not a RIFF file").unwrap();

    let driver = PitchTrackDriver::new(Config::default()).unwrap();
    driver.analyze(&good, 1024).expect("Analysis should succeed");
    let before = driver.committed();
    assert!(!before.path.is_empty());

    let err = driver.analyze(&bad, 1024).unwrap_err();
    assert!(matches!(err, PitchError::Decode(_)), "got {err:?}");
    let after = driver.committed();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(driver.guess_note(0.0, 1.0, (70.0, 700.0)).map(|g| g.note), Some(57));

    std::fs::remove_file(&good).ok();
    std::fs::remove_file(&bad).ok();
}
