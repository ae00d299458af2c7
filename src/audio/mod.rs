pub mod decode;
pub mod memory;
pub mod source;

use std::borrow::Cow;

pub use decode::SymphoniaSource;
pub use memory::MemorySource;
pub use source::{AudioSource, PcmChunks, TimeRange, TrackInfo, BYTES_PER_SAMPLE};

/// View native-endian PCM bytes as samples, copying only when the buffer is
/// not aligned for `i16`. A trailing odd byte is ignored.
pub fn pcm_from_bytes(bytes: &[u8]) -> Cow<'_, [i16]> {
    let even = &bytes[..bytes.len() - bytes.len() % BYTES_PER_SAMPLE];
    match bytemuck::try_cast_slice::<u8, i16>(even) {
        Ok(samples) => Cow::Borrowed(samples),
        Err(_) => Cow::Owned(
            even.chunks_exact(BYTES_PER_SAMPLE)
                .map(|b| i16::from_ne_bytes([b[0], b[1]]))
                .collect(),
        ),
    }
}
