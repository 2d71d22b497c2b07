use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;

use super::cache_error::CacheError;
use super::cache_key::CacheKey;
use super::compression::{Codec, Compression};
use super::eviction::{EvictionManager, EvictionOutcome};
use super::stats::CacheStats;
use super::store::{ClipEntry, Store, StoreError};
use crate::utils::background::BackgroundTasks;

/// Reads and writes decoded clips, and schedules the maintenance work around them.
///
/// On a hit the access time is refreshed and, if compression is enabled, an uncompressed clip
/// is rewritten in compressed form. After every write the size budget is enforced. All of
/// these run on the [`BackgroundTasks`] queue and never fail the operation that caused them.
#[derive(Debug, Clone)]
pub struct ClipCache {
    store: Store,
    codec: Option<Codec>,
    eviction: Option<Arc<EvictionManager>>,
    background: BackgroundTasks,
}

impl ClipCache {
    /// Creates a cache over `store`.
    ///
    /// Without a `codec` new clips are stored raw. Clips that are already compressed can be read
    /// either way. A `budget` of `None` or `0` disables eviction.
    pub fn new(
        store: Store,
        codec: Option<Codec>,
        budget: Option<u64>,
        background: BackgroundTasks,
    ) -> Self {
        let eviction = budget
            .filter(|b| *b > 0)
            .map(|b| Arc::new(EvictionManager::new(store.clone(), b)));

        Self {
            store,
            codec,
            eviction,
            background,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    /// The size budget in bytes, if eviction is enabled.
    pub fn budget(&self) -> Option<u64> {
        self.eviction.as_ref().map(|e| e.budget())
    }

    /// Looks up the decoded audio for `key`.
    ///
    /// Decoding happens on the blocking pool together with the read.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<Bytes>, CacheError> {
        let cache_key = key.to_hex();
        let found = self
            .store
            .run({
                let cache_key = cache_key.clone();
                move |store| {
                    let Some(entry) = store.get(&cache_key)? else {
                        return Ok(None);
                    };
                    let audio: Bytes = match entry.compression {
                        Compression::None => entry.payload,
                        algorithm => Codec::decode(&entry.payload, algorithm)?.into(),
                    };
                    Ok(Some((audio, entry.compression)))
                }
            })
            .await?;

        let Some((audio, compression)) = found else {
            return Ok(None);
        };
        let accessed_at = Utc::now();

        self.spawn_touch(cache_key.clone(), accessed_at);
        if let Some(codec) = self.codec {
            if !compression.is_compressed() {
                self.spawn_recompression(codec, cache_key, audio.clone());
            }
        }

        Ok(Some(audio))
    }

    /// Stores freshly synthesized audio, replacing any previous clip for `key`.
    pub async fn insert(
        &self,
        key: &CacheKey,
        text: &str,
        language_code: &str,
        audio: Bytes,
    ) -> Result<u64, StoreError> {
        let codec = self.codec;
        let entry_key = key.clone();
        let text = text.to_owned();
        let language_code = language_code.to_owned();

        let size = self
            .store
            .run(move |store| {
                let (payload, compression) = match codec {
                    Some(codec) => (Bytes::from(codec.encode(&audio)?), codec.algorithm()),
                    None => (audio, Compression::None),
                };
                let entry = ClipEntry::new(
                    &entry_key,
                    text,
                    language_code,
                    payload,
                    compression,
                    Utc::now(),
                );
                store.put(&entry)?;
                Ok(entry.size_bytes())
            })
            .await?;

        tracing::debug!(cache_key = %key, bytes = size, "Stored clip");
        metric!(histogram("clips.store.size") = size);
        self.spawn_eviction();

        Ok(size)
    }

    /// Deletes the clip for `key`, returning whether it existed.
    pub async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let cache_key = key.to_hex();
        Ok(self
            .store
            .run(move |store| store.delete(&cache_key))
            .await?)
    }

    /// Runs an eviction pass right away instead of waiting for the next write.
    pub async fn evict_now(&self) -> Result<EvictionOutcome, CacheError> {
        match &self.eviction {
            Some(eviction) => Ok(eviction.enforce().await?),
            None => Ok(EvictionOutcome::default()),
        }
    }

    /// A snapshot of the cache contents.
    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let budget = self.budget();
        let stats = self
            .store
            .run(move |store| CacheStats::collect(store, budget))
            .await?;
        stats.emit_metrics();
        Ok(stats)
    }

    fn spawn_touch(&self, cache_key: String, accessed_at: chrono::DateTime<Utc>) {
        let store = self.store.clone();
        self.background.spawn("touch", async move {
            store
                .run(move |store| store.touch_last_accessed(&cache_key, accessed_at))
                .await
                .map(|_| ())
                .inspect_err(|_| metric!(counter("clips.touch.failed") += 1))
        });
    }

    fn spawn_recompression(&self, codec: Codec, cache_key: String, audio: Bytes) {
        let store = self.store.clone();
        self.background.spawn("recompress", async move {
            let result = store
                .run(move |store| {
                    let encoded = codec.encode(&audio)?;
                    store.replace_payload_if_uncompressed(&cache_key, &encoded, codec.algorithm())
                })
                .await;

            let status = match &result {
                Ok(true) => "replaced",
                Ok(false) => "skipped",
                Err(_) => "failed",
            };
            metric!(counter("clips.recompress") += 1, "status" => status);
            result.map(|_| ())
        });
    }

    fn spawn_eviction(&self) {
        if let Some(eviction) = &self.eviction {
            let eviction = Arc::clone(eviction);
            self.background
                .spawn("evict", async move { eviction.enforce().await.map(|_| ()) });
        }
    }
}
