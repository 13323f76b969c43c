//! Runs decode, queue and analysis for one file at a time and keeps the
//! resulting pitch track around for rendering and note guessing.
//!
//! A session uses two threads. The decode worker pumps samples from a
//! [`SampleSource`] into a [`BoundedSampleQueue`]; the calling thread cuts
//! overlapping windows out of the queue and feeds them to an
//! [`AnalyzerSession`]. Results are copied into a live [`PitchTrack`] that
//! other threads may snapshot at any time.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use serde::Serialize;

use super::path::{Detection, NoteGuess, PitchPath, PitchTrack};
use super::session::AnalyzerSession;
use super::tone::Moment;
use crate::audio::decode::SampleSource;
use crate::audio::queue::BoundedSampleQueue;
use crate::config::Config;
use crate::error::{AnalysisError, DecodeError, PitchError, QueueError, Result};

/// Outcome of a finished (or cancelled) analysis session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnalysisSummary {
    /// Windows analysed in this session
    pub windows: u64,
    pub fragments: usize,
    /// Start time of the last analysed window
    pub duration: f64,
    pub cancelled: bool,
}

struct Consumed {
    windows: u64,
    cancelled: bool,
}

pub struct PitchTrackDriver {
    config: Config,
    cancel: AtomicBool,
    running: AtomicBool,
    processed: AtomicU64,
    total: AtomicU64,
    seek_request: Mutex<Option<f64>>,
    queue: Mutex<Option<Arc<BoundedSampleQueue>>>,
    /// Track being built by the running session
    live: Mutex<Option<PitchTrack>>,
    /// Result of the last session that did not fail
    committed: Mutex<Arc<PitchTrack>>,
}

/// Clears the running flag however the session ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PitchTrackDriver {
    pub fn new(config: Config) -> Result<Self> {
        config.analysis.validate()?;
        if config.queue.capacity == 0 {
            let msg = "queue capacity must be positive".to_string();
            return Err(AnalysisError::InvalidConfig(msg).into());
        }
        Ok(Self {
            config,
            cancel: AtomicBool::new(false),
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            total: AtomicU64::new(0),
            seek_request: Mutex::new(None),
            queue: Mutex::new(None),
            live: Mutex::new(None),
            committed: Mutex::new(Arc::new(PitchTrack::default())),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Analyses `path` from the beginning with windows `step_size` samples apart.
    pub fn analyze(&self, path: &Path, step_size: usize) -> Result<AnalysisSummary> {
        self.analyze_from(path, step_size, 0.0)
    }

    /// Analyses `path` starting `start_seconds` into the stream.
    ///
    /// Blocks until the stream ends, the session is cancelled or it fails.
    /// A finished or cancelled session replaces the committed track; a
    /// failed one leaves it untouched.
    pub fn analyze_from(
        &self,
        path: &Path,
        step_size: usize,
        start_seconds: f64,
    ) -> Result<AnalysisSummary> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(PitchError::Busy);
        }
        let _running = RunningGuard(&self.running);
        self.cancel.store(false, Ordering::Release);
        self.processed.store(0, Ordering::Release);
        self.total.store(0, Ordering::Release);
        *lock(&self.seek_request) = None;
        *lock(&self.live) = Some(PitchTrack::default());

        let result = self.run_session(path, step_size, start_seconds);
        *lock(&self.queue) = None;
        let track = lock(&self.live).take().unwrap_or_default();

        match result {
            Ok(consumed) => {
                let summary = AnalysisSummary {
                    windows: consumed.windows,
                    fragments: track.path.len(),
                    duration: track.duration(),
                    cancelled: consumed.cancelled,
                };
                self.total
                    .fetch_max(self.processed.load(Ordering::Acquire), Ordering::AcqRel);
                *lock(&self.committed) = Arc::new(track);
                log::info!(
                    "Analysis {}: {} windows, {} fragments",
                    if summary.cancelled { "cancelled" } else { "finished" },
                    summary.windows,
                    summary.fragments
                );
                Ok(summary)
            }
            Err(err) => {
                log::warn!(
                    "Analysis of {} failed, keeping previous pitch track: {}",
                    path.display(),
                    err
                );
                Err(err)
            }
        }
    }

    fn run_session(&self, path: &Path, step_size: usize, start_seconds: f64) -> Result<Consumed> {
        let mut analysis = self.config.analysis.clone();
        analysis.step_size = step_size;
        let window_size = analysis.window_size;
        let mut session = AnalyzerSession::new(analysis)?;

        let mut source = SampleSource::open(path, session.config().sample_rate)?;
        let queue = Arc::new(BoundedSampleQueue::new(self.config.queue.capacity));

        let mut start = 0;
        if start_seconds > 0.0 {
            start = source.seek(start_seconds)?;
            queue.reset_to(start);
        }
        session.restart(start);
        self.processed.store(start / step_size as u64, Ordering::Release);
        if let Some(total) = source.total_samples() {
            self.total
                .store(window_count(total, window_size, step_size), Ordering::Release);
        }
        log::info!(
            "Analyzing {} ({} channel(s) mixed down, window {}, step {}, from {:.2}s)",
            path.display(),
            source.channels(),
            window_size,
            step_size,
            session.next_time()
        );

        *lock(&self.queue) = Some(Arc::clone(&queue));
        if self.cancel.load(Ordering::Acquire) {
            queue.close();
        }

        thread::scope(|scope| -> Result<Consumed> {
            let worker = thread::Builder::new()
                .name("pitch-decode".into())
                .spawn_scoped(scope, || {
                    decode_worker(source, &queue, &self.cancel, &self.seek_request)
                })
                .map_err(PitchError::Spawn)?;

            let consumed = self.consume(&queue, &mut session);
            queue.close();
            worker.join().map_err(|_| PitchError::WorkerPanicked)??;
            consumed
        })
    }

    /// Cuts windows out of the queue until end of stream or cancellation.
    fn consume(
        &self,
        queue: &BoundedSampleQueue,
        session: &mut AnalyzerSession,
    ) -> Result<Consumed> {
        let window = session.config().window_size;
        let step = session.config().step_size;
        let mut epoch = queue.epoch().id;
        let mut pending: Vec<f32> = Vec::with_capacity(window + queue.capacity());
        let mut chunk = Vec::with_capacity(queue.capacity());
        let mut windows = 0;

        loop {
            chunk.clear();
            let Some(tag) = queue.pop_tagged(&mut chunk) else {
                break;
            };

            // Data from before a seek never shares a window with data after it
            if tag.id != epoch {
                epoch = tag.id;
                pending.clear();
                session.restart(tag.start);
                if let Some(track) = lock(&self.live).as_mut() {
                    track.truncate_from(session.next_time());
                }
                self.processed
                    .store(tag.start / step as u64, Ordering::Release);
                log::debug!("Analysis restarted at {:.3}s", session.next_time());
            }
            pending.extend_from_slice(&chunk);

            let mut batch = PitchTrack::default();
            let mut offset = 0;
            let mut cancelled = false;
            while pending.len() - offset >= window {
                if self.cancel.load(Ordering::Acquire) {
                    cancelled = true;
                    break;
                }
                let index = session.moments().len() as u64;
                let moment = session.feed(&pending[offset..offset + window])?;
                record(&mut batch, index, moment);
                offset += step;
                windows += 1;
                self.processed.fetch_add(1, Ordering::AcqRel);
            }
            pending.drain(..offset);
            if let Some(track) = lock(&self.live).as_mut() {
                track.append(&mut batch);
            }
            if cancelled {
                return Ok(Consumed { windows, cancelled: true });
            }
        }

        Ok(Consumed {
            windows,
            cancelled: self.cancel.load(Ordering::Acquire),
        })
    }

    /// Stops the running session after the window in progress. Fragments
    /// produced so far are kept.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(queue) = lock(&self.queue).as_ref() {
            queue.close();
        }
    }

    /// Asks the running session to continue from `seconds`. Returns `false`
    /// when no session is running.
    ///
    /// The track is cut back to the seek target once the decoder has moved.
    pub fn seek(&self, seconds: f64) -> bool {
        if !self.is_running() {
            return false;
        }
        *lock(&self.seek_request) = Some(seconds.max(0.0));
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// `(windows processed, windows total)`; the total is 0 while unknown.
    pub fn progress(&self) -> (u64, u64) {
        (
            self.processed.load(Ordering::Acquire),
            self.total.load(Ordering::Acquire),
        )
    }

    /// Copy of the track being built, or of the last committed one when
    /// nothing is running.
    pub fn snapshot(&self) -> PitchTrack {
        self.with_track(PitchTrack::clone)
    }

    pub fn path(&self) -> PitchPath {
        self.with_track(|track| track.path.clone())
    }

    pub fn committed(&self) -> Arc<PitchTrack> {
        Arc::clone(&lock(&self.committed))
    }

    /// Best note between `begin` and `end` seconds within the `(min, max)` Hz band.
    pub fn guess_note(&self, begin: f64, end: f64, range: (f64, f64)) -> Option<NoteGuess> {
        let min_stable = self.config.guess.min_stable_windows;
        self.with_track(|track| track.guess_note(begin, end, range, min_stable))
    }

    fn with_track<R>(&self, f: impl FnOnce(&PitchTrack) -> R) -> R {
        if let Some(track) = lock(&self.live).as_ref() {
            return f(track);
        }
        let committed = self.committed();
        f(&committed)
    }
}

fn record(batch: &mut PitchTrack, window: u64, moment: &Moment) {
    batch.push_window(moment.time);
    for tone in &moment.tones {
        batch.push_detection(Detection {
            window,
            time: moment.time,
            freq: tone.freq,
            level: tone.level,
            age: tone.age,
        });
    }
}

/// Number of whole windows in a stream of `samples` samples.
fn window_count(samples: u64, window: usize, step: usize) -> u64 {
    let window = window as u64;
    if samples < window {
        0
    } else {
        (samples - window) / step as u64 + 1
    }
}

/// Body of the decode thread. Signals end of stream when decoding stops
/// cleanly and closes the queue when it fails.
fn decode_worker(
    mut source: SampleSource,
    queue: &BoundedSampleQueue,
    cancel: &AtomicBool,
    seek_request: &Mutex<Option<f64>>,
) -> Result<()> {
    let result = pump_samples(&mut source, queue, cancel, seek_request);
    match result {
        Ok(()) => queue.set_eof(),
        Err(_) => queue.close(),
    }
    result
}

fn pump_samples(
    source: &mut SampleSource,
    queue: &BoundedSampleQueue,
    cancel: &AtomicBool,
    seek_request: &Mutex<Option<f64>>,
) -> Result<()> {
    loop {
        if cancel.load(Ordering::Acquire) || queue.is_closed() {
            return Ok(());
        }
        if let Some(seconds) = lock(seek_request).take() {
            match source.seek(seconds) {
                Ok(position) => queue.reset_to(position),
                // Nothing left to decode from there on
                Err(DecodeError::SeekPastEnd(_)) => {
                    log::debug!("Seek to {:.3}s is past the end, stopping decode", seconds);
                    let position = (seconds * source.target_rate() as f64).round() as u64;
                    queue.reset_to(position);
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
            continue;
        }

        let Some(samples) = source.next_chunk()? else {
            return Ok(());
        };
        for part in samples.chunks(queue.capacity()) {
            if lock(seek_request).is_some() {
                break;
            }
            match queue.push(part) {
                Ok(()) => {}
                Err(QueueError::Reset) => break,
                Err(QueueError::Closed) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_count() {
        assert_eq!(window_count(44_100, 4096, 1024), 40);
        assert_eq!(window_count(4096, 4096, 1024), 1);
        assert_eq!(window_count(4095, 4096, 1024), 0);
        assert_eq!(window_count(0, 4096, 1024), 0);
    }

    #[test]
    fn test_idle_driver_reports_nothing() {
        let driver = PitchTrackDriver::new(Config::default()).unwrap();
        assert_eq!(driver.progress(), (0, 0));
        assert!(!driver.is_running());
        assert!(!driver.seek(1.0));
        assert!(driver.path().is_empty());
        assert_eq!(driver.guess_note(0.0, 1.0, (70.0, 700.0)), None);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.analysis.window_size = 1000;
        assert!(matches!(
            PitchTrackDriver::new(config),
            Err(PitchError::Analysis(AnalysisError::InvalidConfig(_)))
        ));
    }

    #[test]
    fn test_bad_step_fails_before_decoding() {
        let driver = PitchTrackDriver::new(Config::default()).unwrap();
        let err = driver
            .analyze(Path::new("/nonexistent/tone.wav"), 0)
            .unwrap_err();
        assert!(matches!(err, PitchError::Analysis(_)), "got {err:?}");
        assert!(!driver.is_running());
    }

    #[test]
    fn test_missing_file_reports_decode_error() {
        let driver = PitchTrackDriver::new(Config::default()).unwrap();
        let err = driver
            .analyze(Path::new("/nonexistent/tone.wav"), 1024)
            .unwrap_err();
        assert!(
            matches!(err, PitchError::Decode(DecodeError::Open { .. })),
            "got {err:?}"
        );
        assert!(!driver.is_running());
        assert!(driver.committed().path.is_empty());
    }

    #[test]
    fn test_record_copies_every_tone() {
        use crate::pitch::tone::Tone;

        let mut batch = PitchTrack::default();
        let moment = Moment::new(
            0.5,
            vec![
                Tone { freq: 440.0, level: 0.2, age: 4, ..Default::default() },
                Tone { freq: 220.0, level: 0.3, ..Default::default() },
            ],
        );
        record(&mut batch, 7, &moment);
        assert_eq!(batch.window_times, vec![0.5]);
        assert_eq!(batch.detections.len(), 2);
        assert_eq!(batch.detections[0].freq, 220.0);
        assert_eq!(batch.detections[1].age, 4);
        assert!(batch.detections.iter().all(|d| d.window == 7));
        assert_eq!(batch.path.len(), 2);
    }
}
