use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use super::source::{AudioSource, PcmChunks, TimeRange, TrackInfo};
use crate::cache::StableHasher;
use crate::error::{Result, WaveError};

/// Audio source backed by symphonia. Track identifiers are file paths.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaSource;

impl SymphoniaSource {
    pub fn new() -> Self {
        Self
    }
}

struct Probed {
    format: Box<dyn FormatReader>,
    track_id: u32,
    params: CodecParameters,
}

fn probe(path: &Path) -> Result<Probed> {
    let file = std::fs::File::open(path).map_err(|e| WaveError::Open {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| WaveError::Open {
            path: path.to_path_buf(),
            reason: format!("failed to probe audio format: {}", e),
        })?;

    let format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| WaveError::NoAudioTrack(path.display().to_string()))?;

    let track_id = track.id;
    let params = track.codec_params.clone();

    Ok(Probed {
        format,
        track_id,
        params,
    })
}

fn make_decoder(params: &CodecParameters) -> Result<Box<dyn Decoder>> {
    symphonia::default::get_codecs()
        .make(params, &DecoderOptions::default())
        .map_err(|e| WaveError::Decode(format!("failed to create audio decoder: {}", e)))
}

/// Frame position of a packet timestamp.
fn ts_to_frame(params: &CodecParameters, sample_rate: u32, ts: u64) -> u64 {
    match params.time_base {
        Some(tb) => {
            let time = tb.calc_time(ts);
            ((time.seconds as f64 + time.frac) * sample_rate as f64).round() as u64
        }
        None => ts,
    }
}

fn fingerprint(path: &Path) -> u64 {
    let mut hasher = StableHasher::new();
    path.hash(&mut hasher);
    if let Ok(meta) = std::fs::metadata(path) {
        meta.len().hash(&mut hasher);
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok());
        if let Some(mtime) = mtime {
            mtime.as_nanos().hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Count frames by walking packet durations, for containers that do not
/// declare a frame count up front.
fn count_frames(probed: &mut Probed) -> u64 {
    let mut frames = 0u64;
    loop {
        match probed.format.next_packet() {
            Ok(packet) if packet.track_id() == probed.track_id => frames += packet.dur(),
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    frames
}

impl AudioSource for SymphoniaSource {
    fn open(&self, id: &str) -> Result<TrackInfo> {
        let path = PathBuf::from(id);
        let mut probed = probe(&path)?;

        let sample_rate = probed
            .params
            .sample_rate
            .ok_or_else(|| WaveError::UnknownSampleRate(id.to_string()))?;
        let channels = probed.params.channels.map_or(1, |c| c.count()) as u16;
        let total_samples = match probed.params.n_frames {
            Some(n) => n,
            None => count_frames(&mut probed),
        };

        let info = TrackInfo {
            id: id.to_string(),
            sample_rate,
            channels,
            total_samples,
            duration: total_samples as f64 / sample_rate as f64,
            fingerprint: fingerprint(&path),
        };

        log::info!(
            "Opened {}: {} frames, {}Hz, {} ch, {:.1}s",
            path.display(),
            info.total_samples,
            info.sample_rate,
            info.channels,
            info.duration
        );

        Ok(info)
    }

    fn read_pcm(&self, track: &TrackInfo, range: TimeRange) -> Result<PcmChunks> {
        let path = PathBuf::from(&track.id);
        let mut probed = probe(&path)?;
        let mut decoder = make_decoder(&probed.params)?;

        let start_frame = range.start_frame(track.sample_rate);
        let mut skip = start_frame;

        if start_frame > 0 {
            let target = SeekTo::Time {
                time: Time::new(range.start.trunc() as u64, range.start.fract()),
                track_id: Some(probed.track_id),
            };
            match probed.format.seek(SeekMode::Accurate, target) {
                Ok(seeked) => {
                    decoder.reset();
                    let landed = ts_to_frame(&probed.params, track.sample_rate, seeked.actual_ts);
                    skip = start_frame.saturating_sub(landed);
                }
                Err(e) => {
                    // Fall back to decoding from the top and discarding frames.
                    log::debug!("Seek to {:.3}s failed ({}), decoding from start", range.start, e);
                    probed = probe(&path)?;
                    decoder = make_decoder(&probed.params)?;
                }
            }
        }

        Ok(Box::new(SymphoniaChunks {
            format: probed.format,
            decoder,
            track_id: probed.track_id,
            skip_frames: skip,
            sample_buf: None,
            done: false,
        }))
    }
}

struct SymphoniaChunks {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    skip_frames: u64,
    sample_buf: Option<SampleBuffer<i16>>,
    done: bool,
}

impl Iterator for SymphoniaChunks {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.done = true;
                    return None;
                }
                Err(symphonia::core::errors::Error::ResetRequired) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    log::debug!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            let capacity = decoded.capacity() as u64;
            let frames = decoded.frames() as u64;

            let needs_alloc = self
                .sample_buf
                .as_ref()
                .map_or(true, |buf| (buf.capacity() as u64) < capacity * channels as u64);
            if needs_alloc {
                self.sample_buf = Some(SampleBuffer::<i16>::new(capacity, spec));
            }
            let Some(buf) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            let drop = self.skip_frames.min(frames);
            self.skip_frames -= drop;
            let samples = &buf.samples()[drop as usize * channels..];
            if samples.is_empty() {
                continue;
            }

            return Some(Ok(bytemuck::cast_slice(samples).to_vec()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Minimal 16-bit PCM WAV writer for fixtures.
    fn write_wav(path: &Path, samples: &[i16], sample_rate: u32, channels: u16) {
        let data_len = (samples.len() * 2) as u32;
        let block_align = channels * 2;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&out).unwrap();
    }

    fn fixture(dir: &tempfile::TempDir, frames: usize) -> (PathBuf, Vec<i16>) {
        let samples: Vec<i16> = (0..frames)
            .flat_map(|i| {
                let v = ((i % 200) as i16 - 100) * 100;
                [v, -v]
            })
            .collect();
        let path = dir.path().join("fixture.wav");
        write_wav(&path, &samples, 8000, 2);
        (path, samples)
    }

    #[test]
    fn opens_wav_and_reports_track_info() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = fixture(&dir, 16000);
        let info = SymphoniaSource::new().open(path.to_str().unwrap()).unwrap();
        assert_eq!(info.sample_rate, 8000);
        assert_eq!(info.channels, 2);
        assert_eq!(info.total_samples, 16000);
        assert!((info.duration - 2.0).abs() < 1e-9);
    }

    #[test]
    fn missing_file_is_open_failure() {
        let err = SymphoniaSource::new().open("/nonexistent/track.wav").unwrap_err();
        assert!(matches!(err, WaveError::Open { .. }));
    }

    #[test]
    fn reads_full_track_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (path, samples) = fixture(&dir, 8000);
        let source = SymphoniaSource::new();
        let info = source.open(path.to_str().unwrap()).unwrap();
        let bytes: Vec<u8> = source
            .read_pcm(&info, info.full_range())
            .unwrap()
            .flat_map(|c| c.unwrap())
            .collect();
        let decoded = crate::audio::pcm_from_bytes(&bytes);
        assert_eq!(decoded.len(), samples.len());
        assert_eq!(&decoded[..], &samples[..]);
    }

    #[test]
    fn read_starts_at_requested_time() {
        let dir = tempfile::tempdir().unwrap();
        let (path, samples) = fixture(&dir, 16000);
        let source = SymphoniaSource::new();
        let info = source.open(path.to_str().unwrap()).unwrap();
        let bytes: Vec<u8> = source
            .read_pcm(&info, TimeRange::new(1.0, 2.0))
            .unwrap()
            .flat_map(|c| c.unwrap())
            .collect();
        let decoded = crate::audio::pcm_from_bytes(&bytes);
        assert_eq!(&decoded[..16], &samples[16000..16016]);
    }
}
