//! Pitch tracking for audio files.
//!
//! A file is decoded and resampled to mono on one thread, handed over
//! through a bounded sample queue and analysed window by window on another.
//! The analysis refines FFT bins by their phase advance, rebuilds harmonic
//! tones (including missing fundamentals) and links them across windows
//! into a pitch track that can be rendered or queried for a note.

pub mod audio;
pub mod config;
pub mod error;
pub mod pitch;
