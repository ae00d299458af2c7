pub mod range;
pub mod range_cache;
pub mod store;

pub use range::{DecimatedRange, SparseRanges};
pub use range_cache::RangeCache;
pub use store::{cache_key, CacheStore, DirCacheStore, StableHasher};
