use thiserror::Error;

/// Failures while turning a media file into PCM samples.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open audio file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to probe audio format: {0}")]
    Probe(#[source] symphonia::core::errors::Error),
    #[error("no audio tracks found")]
    NoTrack,
    #[error("unknown sample rate")]
    UnknownSampleRate,
    #[error("failed to create audio decoder: {0}")]
    Codec(#[source] symphonia::core::errors::Error),
    #[error("stream error: {0}")]
    Stream(#[source] symphonia::core::errors::Error),
    #[error("gave up after {0} consecutive undecodable packets")]
    TooManyBadPackets(usize),
    #[error("seek to {0:.3}s is past the end of the stream")]
    SeekPastEnd(f64),
    #[error("seek failed: {0}")]
    Seek(#[source] symphonia::core::errors::Error),
    #[error("resampler error: {0}")]
    Resample(String),
}

/// Misuse or shutdown of a [`crate::audio::queue::BoundedSampleQueue`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("push of {len} samples exceeds queue capacity {capacity}")]
    Oversized { len: usize, capacity: usize },
    #[error("queue was reset while the push was waiting")]
    Reset,
    #[error("queue is closed")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("expected window of {expected} samples, got {got}")]
    WindowSize { expected: usize, got: usize },
    #[error("invalid analysis config: {0}")]
    InvalidConfig(String),
}

/// Top-level error for a pitch tracking session.
#[derive(Debug, Error)]
pub enum PitchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("an analysis session is already running")]
    Busy,
    #[error("failed to spawn decode thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("decode thread panicked")]
    WorkerPanicked,
}

pub type Result<T, E = PitchError> = std::result::Result<T, E>;
