//! Audio input: streaming decode to mono PCM and the buffer that hands it
//! from the decode thread to the analysis thread.

pub mod decode;
pub mod queue;
