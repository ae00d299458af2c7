use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use super::source::{AudioSource, PcmChunks, TimeRange, TrackInfo, BYTES_PER_SAMPLE};
use crate::cache::StableHasher;
use crate::error::{Result, WaveError};

/// An already-decoded interleaved 16-bit buffer served as an audio source.
///
/// Like a real decoder it hands out chunks of varying size and keeps
/// delivering past the end of the requested range until the buffer runs out;
/// callers are expected to enforce their own budget.
#[derive(Clone)]
pub struct MemorySource {
    id: String,
    samples: Arc<Vec<i16>>,
    sample_rate: u32,
    channels: u16,
    chunk_frames: Vec<usize>,
    fail_after: Option<usize>,
}

impl MemorySource {
    pub fn new(id: impl Into<String>, samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            id: id.into(),
            samples: Arc::new(samples),
            sample_rate,
            channels: channels.max(1),
            chunk_frames: vec![1024],
            fail_after: None,
        }
    }

    /// Chunk sizes in frames, cycled through while reading.
    pub fn with_chunk_frames(mut self, sizes: Vec<usize>) -> Self {
        let sizes: Vec<usize> = sizes.into_iter().filter(|&s| s > 0).collect();
        if !sizes.is_empty() {
            self.chunk_frames = sizes;
        }
        self
    }

    /// Make every session report a decode error after `chunks` chunks.
    pub fn with_failure_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.channels as usize) as u64
    }

    fn info(&self) -> TrackInfo {
        let mut hasher = StableHasher::new();
        self.id.hash(&mut hasher);
        self.samples.len().hash(&mut hasher);
        TrackInfo {
            id: self.id.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            total_samples: self.frames(),
            duration: self.frames() as f64 / self.sample_rate as f64,
            fingerprint: hasher.finish(),
        }
    }
}

impl AudioSource for MemorySource {
    fn open(&self, id: &str) -> Result<TrackInfo> {
        if id != self.id {
            return Err(WaveError::Open {
                path: PathBuf::from(id),
                reason: "no such in-memory track".into(),
            });
        }
        if self.samples.is_empty() {
            return Err(WaveError::NoAudioTrack(id.to_string()));
        }
        Ok(self.info())
    }

    fn read_pcm(&self, track: &TrackInfo, range: TimeRange) -> Result<PcmChunks> {
        if track.id != self.id {
            return Err(WaveError::Open {
                path: PathBuf::from(&track.id),
                reason: "no such in-memory track".into(),
            });
        }
        let channels = self.channels as usize;
        let start = (range.start_frame(self.sample_rate) as usize * channels).min(self.samples.len());
        Ok(Box::new(MemoryChunks {
            samples: Arc::clone(&self.samples),
            pos: start,
            channels,
            sizes: self.chunk_frames.clone(),
            emitted: 0,
            fail_after: self.fail_after,
        }))
    }
}

struct MemoryChunks {
    samples: Arc<Vec<i16>>,
    pos: usize,
    channels: usize,
    sizes: Vec<usize>,
    emitted: usize,
    fail_after: Option<usize>,
}

impl Iterator for MemoryChunks {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(limit) = self.fail_after {
            if self.emitted == limit {
                self.emitted += 1;
                return Some(Err(WaveError::Decode("injected failure".into())));
            }
            if self.emitted > limit {
                return None;
            }
        }
        if self.pos >= self.samples.len() {
            return None;
        }
        let frames = self.sizes[self.emitted % self.sizes.len()];
        let end = (self.pos + frames * self.channels).min(self.samples.len());
        let chunk = &self.samples[self.pos..end];
        self.pos = end;
        self.emitted += 1;

        let mut bytes = Vec::with_capacity(chunk.len() * BYTES_PER_SAMPLE);
        bytes.extend_from_slice(bytemuck::cast_slice(chunk));
        Some(Ok(bytes))
    }
}

/// Interleaved sine tone with a slow envelope, for tests and demos.
pub fn sine_samples(frames: usize, channels: u16, sample_rate: u32, amplitude: f32) -> Vec<i16> {
    let mut samples = Vec::with_capacity(frames * channels as usize);
    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        // slow envelope so decimated values differ across the track
        let envelope = 0.5 + 0.5 * (t * 0.7).sin().abs();
        let v = (amplitude * envelope * (t * 440.0 * std::f32::consts::TAU).sin()) * i16::MAX as f32;
        for _ in 0..channels {
            samples.push(v as i16);
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_reports_frames_and_duration() {
        let src = MemorySource::new("mem", vec![0; 64000], 32000, 2);
        let info = src.open("mem").unwrap();
        assert_eq!(info.total_samples, 32000);
        assert_eq!(info.channels, 2);
        assert!((info.duration - 1.0).abs() < 1e-9);
    }

    #[test]
    fn open_unknown_track_fails() {
        let src = MemorySource::new("mem", vec![0; 16], 8000, 1);
        assert!(matches!(src.open("other"), Err(WaveError::Open { .. })));
        let empty = MemorySource::new("empty", Vec::new(), 8000, 1);
        assert!(matches!(empty.open("empty"), Err(WaveError::NoAudioTrack(_))));
    }

    #[test]
    fn chunks_cycle_sizes_and_start_at_range() {
        let samples: Vec<i16> = (0..100).collect();
        let src = MemorySource::new("mem", samples, 10, 1).with_chunk_frames(vec![3, 7]);
        let info = src.open("mem").unwrap();
        let chunks: Vec<Vec<u8>> = src
            .read_pcm(&info, TimeRange::new(2.0, 3.0))
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks[0].len(), 6);
        assert_eq!(chunks[1].len(), 14);
        let first = crate::audio::pcm_from_bytes(&chunks[0]);
        assert_eq!(&first[..], &[20, 21, 22]);
        // keeps going to the end of the buffer
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 80 * 2);
    }

    #[test]
    fn injected_failure_ends_session() {
        let src = MemorySource::new("mem", vec![1; 1000], 100, 1)
            .with_chunk_frames(vec![10])
            .with_failure_after(2);
        let info = src.open("mem").unwrap();
        let items: Vec<_> = src.read_pcm(&info, info.full_range()).unwrap().collect();
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());
    }
}
