use crate::audio::{AudioSource, TimeRange, TrackInfo, BYTES_PER_SAMPLE};

/// How a read session ended.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadEnd {
    /// The source ran out of data.
    Completed,
    /// The byte budget for the time range was used up.
    BudgetExhausted,
    /// The handler asked to stop.
    Stopped,
    /// The source reported an error after streaming started.
    Failed(String),
    /// No session was opened; the handler was never called.
    NotOpened,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadSummary {
    pub calls: usize,
    pub bytes: usize,
    pub end: ReadEnd,
}

impl ReadSummary {
    fn not_opened() -> Self {
        Self {
            calls: 0,
            bytes: 0,
            end: ReadEnd::NotOpened,
        }
    }
}

/// Re-chunks a source's PCM stream into fixed-size units.
#[derive(Clone, Copy, Debug)]
pub struct ChunkedPcmReader {
    unit_bytes: usize,
}

impl ChunkedPcmReader {
    pub fn new(unit_bytes: usize) -> Self {
        Self { unit_bytes }
    }

    pub fn unit_bytes(&self) -> usize {
        self.unit_bytes
    }

    /// Bytes of 16-bit interleaved PCM covering `range` on `track`.
    pub fn byte_budget(track: &TrackInfo, range: &TimeRange) -> usize {
        range.frame_count(track.sample_rate) as usize * track.channels as usize * BYTES_PER_SAMPLE
    }

    /// Stream `range` through `handler`, one full unit per call, then one
    /// terminal call (`last_call == true`) with whatever remains, possibly
    /// nothing. The handler returns `false` to stop; no terminal call follows
    /// a stop.
    pub fn iterate_sample_data<S, F>(
        &self,
        source: &S,
        track: &TrackInfo,
        range: TimeRange,
        mut handler: F,
    ) -> ReadSummary
    where
        S: AudioSource + ?Sized,
        F: FnMut(&[u8], bool) -> bool,
    {
        let frame_bytes = track.channels as usize * BYTES_PER_SAMPLE;
        if self.unit_bytes == 0 || frame_bytes == 0 || self.unit_bytes % frame_bytes != 0 {
            log::debug!("Refusing to read {}: bad unit size {}", track.id, self.unit_bytes);
            return ReadSummary::not_opened();
        }
        if range.is_empty() || track.sample_rate == 0 {
            return ReadSummary::not_opened();
        }

        let mut stream = match source.read_pcm(track, range) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Failed to open PCM session for {}: {}", track.id, e);
                return ReadSummary::not_opened();
            }
        };

        let mut remaining = Self::byte_budget(track, &range);
        let mut buffer: Vec<u8> = Vec::with_capacity(self.unit_bytes);
        let mut summary = ReadSummary {
            calls: 0,
            bytes: 0,
            end: ReadEnd::Completed,
        };

        while remaining > 0 {
            let chunk = match stream.next() {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    log::warn!("Decode anomaly in {} after {} bytes: {}", track.id, summary.bytes, e);
                    summary.end = ReadEnd::Failed(e.to_string());
                    break;
                }
                None => break,
            };

            let take = chunk.len().min(remaining);
            remaining -= take;
            let mut data = &chunk[..take];

            while !data.is_empty() {
                let n = (self.unit_bytes - buffer.len()).min(data.len());
                buffer.extend_from_slice(&data[..n]);
                data = &data[n..];

                if buffer.len() == self.unit_bytes {
                    summary.calls += 1;
                    summary.bytes += buffer.len();
                    if !handler(&buffer, false) {
                        summary.end = ReadEnd::Stopped;
                        return summary;
                    }
                    buffer.clear();
                }
            }

            if remaining == 0 {
                summary.end = ReadEnd::BudgetExhausted;
            }
        }

        summary.calls += 1;
        summary.bytes += buffer.len();
        handler(&buffer, true);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::{sine_samples, MemorySource};
    use crate::audio::AudioSource;

    fn reference_track() -> (MemorySource, TrackInfo) {
        let samples = sine_samples(872064, 2, 32000, 0.8);
        let source = MemorySource::new("fixture", samples, 32000, 2).with_chunk_frames(vec![4096, 1152, 333]);
        let info = source.open("fixture").unwrap();
        (source, info)
    }

    #[test]
    fn one_second_in_four_calls() {
        let (source, track) = reference_track();
        assert_eq!(track.total_samples, 872064);
        let reader = ChunkedPcmReader::new(40000);
        let mut sizes = Vec::new();
        let summary = reader.iterate_sample_data(&source, &track, TimeRange::new(1.0, 2.0), |bytes, last| {
            sizes.push((bytes.len(), last));
            true
        });
        assert_eq!(sizes, vec![(40000, false), (40000, false), (40000, false), (8000, true)]);
        assert_eq!(summary.calls, 4);
        assert_eq!(summary.bytes, 128000);
        assert_eq!(summary.end, ReadEnd::BudgetExhausted);
    }

    #[test]
    fn decimation_sized_units() {
        let (source, track) = reference_track();
        let rate = 32000 / 25;
        let unit = track.channels as usize * rate * BYTES_PER_SAMPLE;
        let reader = ChunkedPcmReader::new(unit);
        let mut full = 0;
        let mut last = None;
        reader.iterate_sample_data(&source, &track, TimeRange::new(0.0, 1.0), |bytes, is_last| {
            if is_last {
                last = Some(bytes.len());
            } else {
                assert_eq!(bytes.len(), unit);
                full += 1;
            }
            true
        });
        assert_eq!(full, 25);
        assert_eq!(last, Some(0));
    }

    #[test]
    fn stop_prevents_further_calls() {
        let (source, track) = reference_track();
        let reader = ChunkedPcmReader::new(5120);
        let mut calls = 0;
        let summary = reader.iterate_sample_data(&source, &track, track.full_range(), |_, _| {
            calls += 1;
            calls < 3
        });
        assert_eq!(calls, 3);
        assert_eq!(summary.end, ReadEnd::Stopped);
    }

    #[test]
    fn end_of_stream_flushes_partial_unit() {
        let source = MemorySource::new("short", vec![100; 2 * 1000], 1000, 2).with_chunk_frames(vec![77]);
        let track = source.open("short").unwrap();
        let reader = ChunkedPcmReader::new(4 * 300);
        let mut sizes = Vec::new();
        let summary = reader.iterate_sample_data(&source, &track, TimeRange::new(0.0, 5.0), |b, last| {
            sizes.push((b.len(), last));
            true
        });
        assert_eq!(sizes.last(), Some(&(4 * 100, true)));
        assert_eq!(sizes.len(), 4);
        assert_eq!(summary.end, ReadEnd::Completed);
    }

    #[test]
    fn failure_still_flushes_what_was_read() {
        let source = MemorySource::new("bad", vec![100; 1000], 1000, 1)
            .with_chunk_frames(vec![150])
            .with_failure_after(2);
        let track = source.open("bad").unwrap();
        let reader = ChunkedPcmReader::new(2 * 100);
        let mut sizes = Vec::new();
        let summary = reader.iterate_sample_data(&source, &track, track.full_range(), |b, last| {
            sizes.push((b.len(), last));
            true
        });
        assert_eq!(sizes, vec![(200, false), (200, false), (200, false), (0, true)]);
        assert!(matches!(summary.end, ReadEnd::Failed(_)));
    }

    #[test]
    fn invalid_requests_are_noops() {
        let (source, track) = reference_track();
        let mut called = false;
        for (unit, range) in [
            (0, TimeRange::new(0.0, 1.0)),
            (3, TimeRange::new(0.0, 1.0)),
            (4000, TimeRange::new(2.0, 2.0)),
        ] {
            let summary = ChunkedPcmReader::new(unit).iterate_sample_data(&source, &track, range, |_, _| {
                called = true;
                true
            });
            assert_eq!(summary.end, ReadEnd::NotOpened);
        }
        assert!(!called);
    }

    #[test]
    fn unopenable_track_is_noop() {
        let (source, mut track) = reference_track();
        track.id = "gone".into();
        let summary = ChunkedPcmReader::new(4000).iterate_sample_data(&source, &track, TimeRange::new(0.0, 1.0), |_, _| true);
        assert_eq!(summary, ReadSummary::not_opened());
    }
}
