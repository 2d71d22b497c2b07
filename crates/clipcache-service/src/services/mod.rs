//! The clip service and a way to initialize it.
//!
//! [`ClipService`] is the entry point for everything that serves clips: it validates requests,
//! answers them from the store and falls back to the configured [`Synthesizer`] for clips that
//! are missing. [`open_cache`] creates just the storage side, for tools that only inspect or
//! maintain an existing cache.

use std::sync::Arc;
use std::time::Duration;

use crate::caching::{
    CacheError, CacheKey, CacheStats, ClipCache, Codec, EvictionOutcome, Store, StoreError,
};
use crate::config::{Config, DatabaseConfig};
use crate::types::{CachedLookup, ClipRequest, DeleteOutcome, FetchedClip};
use crate::utils::background::BackgroundTasks;

pub mod azure;
pub mod fetcher;
pub mod synthesizer;

pub use self::azure::AzureSynthesizer;
pub use self::fetcher::FetchCoordinator;
pub use self::synthesizer::Synthesizer;

/// Opens the store configured in `database` and wraps it in a [`ClipCache`].
pub fn open_cache(
    database: &DatabaseConfig,
    background: BackgroundTasks,
) -> Result<ClipCache, StoreError> {
    let store = Store::open(&database.path)?;
    Ok(cache_from_store(store, database, background))
}

fn cache_from_store(
    store: Store,
    database: &DatabaseConfig,
    background: BackgroundTasks,
) -> ClipCache {
    let codec = database
        .compression
        .then(|| Codec::zstd(database.compression_level));
    ClipCache::new(store, codec, database.max_size_bytes(), background)
}

/// Rejects requests that cannot name a clip.
fn validate(text: &str, language_code: &str) -> Result<(), CacheError> {
    if text.trim().is_empty() {
        return Err(CacheError::Validation("text must not be empty"));
    }
    if language_code.trim().is_empty() {
        return Err(CacheError::Validation("language code must not be empty"));
    }
    Ok(())
}

/// Serves synthesized audio clips from a persistent cache.
pub struct ClipService {
    coordinator: FetchCoordinator,
    synthesizer: Arc<dyn Synthesizer>,
}

impl ClipService {
    /// Creates the service from `config`, opening (and migrating) the configured store.
    pub fn create(config: &Config, synthesizer: Arc<dyn Synthesizer>) -> Result<Self, StoreError> {
        let store = Store::open(&config.database.path)?;
        tracing::info!(
            path = %config.database.path.display(),
            compression = config.database.compression,
            max_size_mb = ?config.database.max_size_mb,
            "Opened clip cache"
        );
        Ok(Self::with_store(store, config, synthesizer))
    }

    /// Creates the service over an already opened store.
    pub fn with_store(store: Store, config: &Config, synthesizer: Arc<dyn Synthesizer>) -> Self {
        let background = BackgroundTasks::new(config.fetch.max_background_tasks);
        let cache = cache_from_store(store, &config.database, background);

        Self {
            coordinator: FetchCoordinator::new(cache, config.fetch.synthesis_timeout),
            synthesizer,
        }
    }

    pub fn cache(&self) -> &ClipCache {
        self.coordinator.cache()
    }

    /// Returns the clip, synthesizing it with the configured synthesizer if it is not cached.
    pub async fn get_or_fetch(
        &self,
        text: &str,
        language_code: &str,
        force_refresh: bool,
    ) -> Result<FetchedClip, CacheError> {
        self.get_or_fetch_with(
            text,
            language_code,
            force_refresh,
            Arc::clone(&self.synthesizer),
        )
        .await
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch), with an explicit synthesizer.
    pub async fn get_or_fetch_with(
        &self,
        text: &str,
        language_code: &str,
        force_refresh: bool,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Result<FetchedClip, CacheError> {
        validate(text, language_code)?;
        self.coordinator
            .get_or_fetch(text, language_code, force_refresh, synthesizer)
            .await
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch), but gives up after `deadline`.
    ///
    /// Only this caller stops waiting and receives [`CacheError::Timeout`]. A synthesis that is
    /// already running continues for its other subscribers and still populates the store.
    pub async fn get_or_fetch_within(
        &self,
        text: &str,
        language_code: &str,
        force_refresh: bool,
        deadline: Duration,
    ) -> Result<FetchedClip, CacheError> {
        tokio::time::timeout(deadline, self.get_or_fetch(text, language_code, force_refresh))
            .await
            .unwrap_or_else(|_| {
                tracing::debug!(?deadline, "Gave up waiting for clip");
                metric!(counter("clips.deadline_exceeded") += 1);
                Err(CacheError::Timeout(deadline))
            })
    }

    /// Returns the clips for all `requests` in order, or the first error.
    ///
    /// Invalid requests fail the batch before anything is looked up.
    pub async fn bulk_get_or_fetch(
        &self,
        requests: &[ClipRequest],
        force_refresh: bool,
    ) -> Result<Vec<FetchedClip>, CacheError> {
        for request in requests {
            validate(&request.text, &request.language_code)?;
        }
        self.coordinator
            .bulk_get_or_fetch(requests, force_refresh, Arc::clone(&self.synthesizer))
            .await
    }

    /// Returns the clip only if it is cached. Never calls the synthesizer.
    pub async fn get_cached_only(
        &self,
        text: &str,
        language_code: &str,
    ) -> Result<CachedLookup, CacheError> {
        validate(text, language_code)?;
        let key = CacheKey::for_clip(text, language_code);
        let audio = self.cache().lookup(&key).await?;
        Ok(CachedLookup {
            key: key.to_hex(),
            audio,
        })
    }

    /// Deletes the clip. Deleting a clip that is not cached is not an error.
    pub async fn delete(
        &self,
        text: &str,
        language_code: &str,
    ) -> Result<DeleteOutcome, CacheError> {
        validate(text, language_code)?;
        let key = CacheKey::for_clip(text, language_code);
        let deleted = self.cache().remove(&key).await?;
        if deleted {
            tracing::debug!(cache_key = %key, "Deleted clip");
        }
        Ok(DeleteOutcome {
            key: key.to_hex(),
            deleted,
        })
    }

    pub async fn get_stats(&self) -> Result<CacheStats, CacheError> {
        self.cache().stats().await
    }

    /// Enforces the size budget immediately.
    pub async fn evict_now(&self) -> Result<EvictionOutcome, CacheError> {
        self.cache().evict_now().await
    }

    /// Waits for all queued maintenance work (access tracking, recompression, eviction).
    pub async fn flush_background(&self) {
        self.cache().background().drain().await;
    }

    /// Cancels running syntheses and waits for the maintenance queue to empty.
    ///
    /// Everyone waiting on a synthesis receives [`CacheError::Cancelled`].
    pub async fn shutdown(&self) {
        self.coordinator.shutdown();
        self.flush_background().await;
    }
}
