use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::audio::TrackInfo;

/// Blob store for fully decimated tracks.
pub trait CacheStore {
    fn load(&self, key: &str) -> Option<Vec<f32>>;
    fn save(&self, key: &str, values: &[f32]) -> bool;
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. Unlike `DefaultHasher` its output does not change between
/// Rust releases, so persisted keys stay valid across toolchain upgrades.
#[derive(Clone, Copy, Debug)]
pub struct StableHasher(u64);

impl StableHasher {
    pub fn new() -> Self {
        Self(FNV_OFFSET)
    }
}

impl Default for StableHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for StableHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

/// Opaque key for a track decimated at `rate` with clipping floor `floor`.
pub fn cache_key(track: &TrackInfo, rate: usize, floor: f32) -> String {
    let mut hasher = StableHasher::new();
    track.fingerprint.hash(&mut hasher);
    track.id.hash(&mut hasher);
    track.sample_rate.hash(&mut hasher);
    track.channels.hash(&mut hasher);
    track.total_samples.hash(&mut hasher);
    rate.hash(&mut hasher);
    floor.to_bits().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Stores each waveform as a raw `f32` file named after its key.
#[derive(Clone, Debug)]
pub struct DirCacheStore {
    dir: PathBuf,
}

impl DirCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<cache dir>/waveline/waveforms`, if the platform has a cache dir.
    pub fn default_location() -> Option<Self> {
        let base = dirs::cache_dir().or_else(dirs::home_dir)?;
        Some(Self::new(base.join("waveline").join("waveforms")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.wf", key))
    }
}

impl CacheStore for DirCacheStore {
    fn load(&self, key: &str) -> Option<Vec<f32>> {
        let bytes = std::fs::read(self.path_for(key)).ok()?;
        if bytes.len() % 4 != 0 {
            log::warn!("Ignoring corrupt waveform cache entry {}", key);
            return None;
        }
        Some(bytemuck::allocation::pod_collect_to_vec::<u8, f32>(&bytes))
    }

    fn save(&self, key: &str, values: &[f32]) -> bool {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            log::warn!("Failed to create cache dir {}: {}", self.dir.display(), e);
            return false;
        }
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        let written = std::fs::write(&tmp, bytemuck::cast_slice::<f32, u8>(values))
            .and_then(|_| std::fs::rename(&tmp, &path));
        match written {
            Ok(()) => {
                log::debug!("Saved waveform cache {} ({} values)", path.display(), values.len());
                true
            }
            Err(e) => {
                log::warn!("Failed to write waveform cache {}: {}", path.display(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(fingerprint: u64) -> TrackInfo {
        TrackInfo {
            id: "song.flac".into(),
            sample_rate: 44100,
            channels: 2,
            total_samples: 441000,
            duration: 10.0,
            fingerprint,
        }
    }

    #[test]
    fn key_depends_on_identity_and_rate() {
        let a = cache_key(&track(1), 441, -50.0);
        assert_eq!(a, cache_key(&track(1), 441, -50.0));
        assert_ne!(a, cache_key(&track(2), 441, -50.0));
        assert_ne!(a, cache_key(&track(1), 882, -50.0));
        assert_ne!(a, cache_key(&track(1), 441, -60.0));
    }

    #[test]
    fn stable_hasher_matches_fnv1a() {
        let empty = StableHasher::new();
        assert_eq!(empty.finish(), 0xcbf29ce484222325);
        let mut a = StableHasher::new();
        a.write(b"a");
        assert_eq!(a.finish(), 0xaf63dc4c8601ec8c);
        let mut foobar = StableHasher::new();
        foobar.write(b"foobar");
        assert_eq!(foobar.finish(), 0x85944171f73967e8);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirCacheStore::new(dir.path().join("wf"));
        let values = vec![-50.0, -12.5, -3.25, 0.0];
        assert!(store.save("abc", &values));
        assert_eq!(store.load("abc"), Some(values));
        assert_eq!(store.load("missing"), None);
    }

    #[test]
    fn corrupt_entry_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirCacheStore::new(dir.path());
        std::fs::write(dir.path().join("bad.wf"), [1u8, 2, 3]).unwrap();
        assert_eq!(store.load("bad"), None);
    }
}
