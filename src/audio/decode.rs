use std::path::Path;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::{Error as SymphoniaError, SeekErrorKind};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::error::DecodeError;

/// Consecutive undecodable packets tolerated before the stream is abandoned.
pub const MAX_CONSECUTIVE_BAD_PACKETS: usize = 8;

const RESAMPLER_CHUNK: usize = 1024;

/// Streaming decoder producing mono `f32` samples at a fixed target rate.
pub struct SampleSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    source_rate: u32,
    target_rate: u32,
    channels: usize,
    total_frames: Option<u64>,
    resampler: Option<StreamResampler>,
    sample_buf: Option<SampleBuffer<f32>>,
    health: PacketHealth,
    /// Frames to drop before the position requested by the last seek
    trim_until: Option<u64>,
    finished: bool,
}

impl SampleSource {
    pub fn open(path: &Path, target_rate: u32) -> Result<Self, DecodeError> {
        let file = std::fs::File::open(path).map_err(|source| DecodeError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(DecodeError::Probe)?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoTrack)?;

        let track_id = track.id;
        let channels = track.codec_params.channels.map_or(1, |c| c.count());
        let source_rate = track
            .codec_params
            .sample_rate
            .ok_or(DecodeError::UnknownSampleRate)?;
        let time_base = track.codec_params.time_base;
        let total_frames = track.codec_params.n_frames;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(DecodeError::Codec)?;

        let resampler = if source_rate != target_rate {
            Some(StreamResampler::new(source_rate, target_rate)?)
        } else {
            None
        };

        log::info!(
            "Opened {}: {}Hz, {} channel(s){}",
            path.display(),
            source_rate,
            channels,
            if resampler.is_some() {
                format!(", resampling to {}Hz", target_rate)
            } else {
                String::new()
            }
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            time_base,
            source_rate,
            target_rate,
            channels,
            total_frames,
            resampler,
            sample_buf: None,
            health: PacketHealth::default(),
            trim_until: None,
            finished: false,
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Stream length in samples at the target rate, when the container says.
    pub fn total_samples(&self) -> Option<u64> {
        self.total_frames
            .map(|n| n * self.target_rate as u64 / self.source_rate as u64)
    }

    /// Decodes the next packet of the selected track.
    ///
    /// Returns `Ok(None)` at end of stream. A returned chunk may be empty
    /// (resampler still filling up, packet trimmed away after a seek).
    pub fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, DecodeError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return self.finish();
                }
                Err(SymphoniaError::ResetRequired) => {
                    log::warn!("Stream parameters changed mid-file, stopping decode");
                    return self.finish();
                }
                Err(e) => return Err(DecodeError::Stream(e)),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let ts = packet.ts();
            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(msg)) => {
                    self.health.skip_bad_packet(ts, msg)?;
                    continue;
                }
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::InvalidData =>
                {
                    self.health.skip_bad_packet(ts, "invalid data")?;
                    continue;
                }
                Err(e) => return Err(DecodeError::Stream(e)),
            };
            self.health.decoded(ts);

            let spec = *decoded.spec();
            let channels = spec.channels.count().max(1);
            let frames = decoded.frames();

            if self
                .sample_buf
                .as_ref()
                .is_some_and(|b| b.capacity() < decoded.capacity() * channels)
            {
                self.sample_buf = None;
            }
            let buf = self
                .sample_buf
                .get_or_insert_with(|| SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            buf.copy_interleaved_ref(decoded);
            let samples = buf.samples();

            // Drop the head of the first packet after an accurate seek
            let skip = match self.trim_until {
                Some(target) if ts + frames as u64 <= target => continue,
                Some(target) => {
                    self.trim_until = None;
                    target.saturating_sub(ts) as usize
                }
                None => 0,
            };

            let mono: Vec<f32> = if channels == 1 {
                samples[skip..].to_vec()
            } else {
                samples
                    .chunks(channels)
                    .skip(skip)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                    .collect()
            };

            return match self.resampler {
                Some(ref mut r) => r.push(&mono).map(Some),
                None => Ok(Some(mono)),
            };
        }
    }

    fn finish(&mut self) -> Result<Option<Vec<f32>>, DecodeError> {
        self.finished = true;
        match self.resampler {
            Some(ref mut r) => r.finish().map(Some),
            None => Ok(None),
        }
    }

    /// Seeks to `seconds` and returns the new position in target-rate samples.
    pub fn seek(&mut self, seconds: f64) -> Result<u64, DecodeError> {
        let seconds = seconds.max(0.0);
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::new(seconds.trunc() as u64, seconds.fract()),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|err| match err {
                SymphoniaError::SeekError(SeekErrorKind::OutOfRange) => {
                    DecodeError::SeekPastEnd(seconds)
                }
                err => DecodeError::Seek(err),
            })?;
        self.decoder.reset();
        if let Some(ref mut r) = self.resampler {
            r.reset();
        }
        self.trim_until = Some(seeked.required_ts);
        self.health = PacketHealth::default();
        self.finished = false;

        let actual = match self.time_base {
            Some(tb) => {
                let t = tb.calc_time(seeked.required_ts);
                t.seconds as f64 + t.frac
            }
            None => seeked.required_ts as f64 / self.source_rate as f64,
        };
        log::debug!("Seeked to {:.3}s (requested {:.3}s)", actual, seconds);
        Ok((actual * self.target_rate as f64).round() as u64)
    }
}

/// Tracks decode failures between good packets.
///
/// Single bad packets are skipped as long as the stream keeps moving
/// forward; a stuck timestamp or too many failures in a row is fatal.
#[derive(Debug, Default)]
struct PacketHealth {
    last_ts: Option<u64>,
    bad_packets: usize,
}

impl PacketHealth {
    fn decoded(&mut self, ts: u64) {
        self.bad_packets = 0;
        self.last_ts = Some(ts);
    }

    fn skip_bad_packet(&mut self, ts: u64, msg: &str) -> Result<(), DecodeError> {
        self.bad_packets += 1;
        let advancing = self.last_ts.map_or(true, |last| ts > last);
        if !advancing || self.bad_packets > MAX_CONSECUTIVE_BAD_PACKETS {
            return Err(DecodeError::TooManyBadPackets(self.bad_packets));
        }
        log::warn!("Skipping undecodable packet at ts {}: {}", ts, msg);
        self.last_ts = Some(ts);
        Ok(())
    }
}

/// Mono sinc resampler fed with arbitrarily sized chunks.
struct StreamResampler {
    inner: SincFixedIn<f32>,
    pending: Vec<f32>,
    ratio: f64,
    /// Leading output samples still owed to the filter delay
    delay: usize,
    consumed: u64,
    produced: u64,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32) -> Result<Self, DecodeError> {
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = to_rate as f64 / from_rate as f64;
        let inner = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLER_CHUNK, 1)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
        let delay = inner.output_delay();
        Ok(Self {
            inner,
            pending: Vec::with_capacity(RESAMPLER_CHUNK * 2),
            ratio,
            delay,
            consumed: 0,
            produced: 0,
        })
    }

    fn push(&mut self, input: &[f32]) -> Result<Vec<f32>, DecodeError> {
        self.consumed += input.len() as u64;
        self.pending.extend_from_slice(input);
        let mut out = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let res = self
                .inner
                .process(&[chunk], None)
                .map_err(|e| DecodeError::Resample(e.to_string()))?;
            self.emit(&res[0], &mut out);
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<f32>, DecodeError> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let chunk = std::mem::take(&mut self.pending);
            let res = self
                .inner
                .process_partial(Some(&[chunk]), None)
                .map_err(|e| DecodeError::Resample(e.to_string()))?;
            self.emit(&res[0], &mut out);
        }
        // Flush the samples still held back by the filter delay
        let res = self
            .inner
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
        self.emit(&res[0], &mut out);

        // Zero padding of the last chunks must not lengthen the stream
        let expected = (self.consumed as f64 * self.ratio).round() as u64;
        let excess = (self.produced.saturating_sub(expected) as usize).min(out.len());
        out.truncate(out.len() - excess);
        self.produced -= excess as u64;
        Ok(out)
    }

    fn emit(&mut self, resampled: &[f32], out: &mut Vec<f32>) {
        let skip = self.delay.min(resampled.len());
        self.delay -= skip;
        self.produced += (resampled.len() - skip) as u64;
        out.extend_from_slice(&resampled[skip..]);
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.pending.clear();
        self.delay = self.inner.output_delay();
        self.consumed = 0;
        self.produced = 0;
    }
}
