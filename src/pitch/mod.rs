//! Pitch detection: spectral analysis of overlapping windows, tone
//! tracking across windows and the driver that runs it over a file.

pub mod analyzer;
pub mod driver;
pub mod path;
pub mod session;
pub mod tone;

pub use driver::{AnalysisSummary, PitchTrackDriver};
pub use path::{NoteGuess, PitchPath, PitchTrack, Viewport};
pub use tone::{note_name, PitchFragment};
