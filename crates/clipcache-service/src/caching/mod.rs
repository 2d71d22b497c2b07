//! # Clip caching
//!
//! Synthesizing speech is slow and usually billed per request, so every clip is synthesized
//! once and then served from a local SQLite database.
//!
//! ## Layers
//!
//! - Request coalescing: concurrent requests for the same missing clip share a single synthesis.
//!   This lives in [`FetchCoordinator`](crate::services::FetchCoordinator).
//! - The persistent [`Store`], one row per clip, keyed by the hex [`CacheKey`].
//! - An optional zstd [`Codec`] applied on write. Reads decode whatever a row declares,
//!   independent of the current setting.
//! - An optional size budget enforced by the [`EvictionManager`] after every write.
//!
//! A request goes through the following steps:
//! - Unless a refresh is forced, the store is consulted. A hit is decoded and returned, its
//!   access time is refreshed in the background, and it is recompressed in the background if
//!   compression is enabled but the row is raw.
//! - On a miss the request joins or starts a flight, which calls the synthesizer, stores the
//!   result and triggers eviction.
//!
//! ### Metrics
//!
//! - `clips.access`: All accesses.
//! - `clips.hit` / `clips.miss`: Store lookups.
//! - `clips.flight.led` / `clips.flight.joined`: Flights started and joined.
//! - `clips.synthesis`: Synthesizer calls, tagged with `status`.
//! - `clips.synthesis.duration`: Time spent in successful syntheses.
//! - `clips.store.write`: Writes after a synthesis, tagged with `status`.
//! - `clips.store.size`: A histogram of stored payload sizes.
//! - `clips.touch.failed`: Access time updates that failed.
//! - `clips.recompress`: Background recompressions, tagged with `status`.
//! - `clips.evict.clips` / `clips.evict.bytes`: What eviction removed.
//! - `clips.size.bytes` / `clips.size.count`: Gauges, reported whenever stats are collected.

mod cache_error;
mod cache_key;
mod clip_cache;
mod compression;
mod eviction;
mod stats;
pub mod store;


pub use cache_error::{CacheError, SynthesisError};
pub use cache_key::{CacheKey, normalize_text};
pub use clip_cache::ClipCache;
pub use compression::{Codec, CodecError, Compression};
pub use eviction::{EVICTION_TARGET_RATIO, EvictionManager, EvictionOutcome, EvictionPlan, plan_eviction};
pub use stats::{CacheStats, LanguageStats};
pub use store::{ClipEntry, Store, StoreError};
