//! Coalescing of concurrent fetches for the same clip.
//!
//! Every distinct clip that is missing from the store is synthesized by exactly one task, the
//! *flight*. Callers asking for the same clip while the flight is running subscribe to it
//! instead of calling the synthesizer again, and all of them observe the same outcome.

use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared, try_join_all};
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheError, CacheKey, ClipCache};
use crate::types::{ClipRequest, FetchedClip};

use super::synthesizer::Synthesizer;

type FlightChannel = Shared<oneshot::Receiver<Result<Bytes, CacheError>>>;
type FlightMap = Arc<Mutex<HashMap<CacheKey, FlightChannel>>>;

/// Removes a flight from the map when its task ends, even if it panics.
struct FlightGuard {
    flights: FlightMap,
    key: CacheKey,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if let Ok(mut flights) = self.flights.lock() {
            flights.remove(&self.key);
        }
    }
}

/// Serves clips from the [`ClipCache`] and synthesizes the ones that are missing.
pub struct FetchCoordinator {
    cache: ClipCache,
    flights: FlightMap,
    synthesis_timeout: Duration,
    shutdown: CancellationToken,
}

impl FetchCoordinator {
    pub fn new(cache: ClipCache, synthesis_timeout: Duration) -> Self {
        Self {
            cache,
            flights: Arc::new(Mutex::new(HashMap::new())),
            synthesis_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn cache(&self) -> &ClipCache {
        &self.cache
    }

    /// Number of clips currently being synthesized.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().unwrap().len()
    }

    /// Returns the audio for `text` in `language_code`, synthesizing it if necessary.
    ///
    /// With `force_refresh` the store is bypassed and the clip is synthesized again, unless an
    /// identical fetch is already in flight, which is joined instead.
    ///
    /// Dropping the returned future only stops this caller from waiting. The synthesis keeps
    /// running for the other subscribers and still populates the store.
    pub async fn get_or_fetch(
        &self,
        text: &str,
        language_code: &str,
        force_refresh: bool,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Result<FetchedClip, CacheError> {
        let key = CacheKey::for_clip(text, language_code);
        metric!(counter("clips.access") += 1);

        if !force_refresh {
            if let Some(audio) = self.cache.lookup(&key).await? {
                metric!(counter("clips.hit") += 1);
                return Ok(FetchedClip {
                    audio,
                    key: key.to_hex(),
                    cached: true,
                });
            }
            metric!(counter("clips.miss") += 1);
        }

        if self.shutdown.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let channel = self.join_or_start_flight(&key, text, language_code, synthesizer);
        let audio = channel.await.unwrap_or(Err(CacheError::Cancelled))?;

        Ok(FetchedClip {
            audio,
            key: key.to_hex(),
            cached: false,
        })
    }

    /// Fetches all `requests` concurrently, returning the clips in request order.
    ///
    /// The first failure fails the whole batch. Flights that were started for other requests
    /// keep running and still populate the store.
    pub async fn bulk_get_or_fetch(
        &self,
        requests: &[ClipRequest],
        force_refresh: bool,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Result<Vec<FetchedClip>, CacheError> {
        let fetches = requests.iter().map(|request| {
            self.get_or_fetch(
                &request.text,
                &request.language_code,
                force_refresh,
                Arc::clone(&synthesizer),
            )
        });
        try_join_all(fetches).await
    }

    /// Cancels all running flights. Every subscriber receives [`CacheError::Cancelled`], and so
    /// does every later fetch that would need the synthesizer. Cached clips are still served.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Subscribes to the flight for `key`, starting one if there is none.
    ///
    /// NOTE: This is not `async`, the flight is spawned eagerly so that it runs to completion
    /// independently of whoever awaits the channel.
    fn join_or_start_flight(
        &self,
        key: &CacheKey,
        text: &str,
        language_code: &str,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> FlightChannel {
        let mut flights = self.flights.lock().unwrap();
        if let Some(channel) = flights.get(key) {
            metric!(counter("clips.flight.joined") += 1);
            tracing::trace!(cache_key = %key, "Joined running synthesis");
            return channel.clone();
        }
        metric!(counter("clips.flight.led") += 1);

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        flights.insert(key.clone(), channel.clone());
        drop(flights);

        let guard = FlightGuard {
            flights: Arc::clone(&self.flights),
            key: key.clone(),
        };
        let synthesis = synthesize_and_store(
            self.cache.clone(),
            key.clone(),
            text.to_owned(),
            language_code.to_owned(),
            synthesizer,
            self.synthesis_timeout,
        );
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(CacheError::Cancelled),
                result = synthesis => result,
            };
            // Leave the map before releasing the subscribers. Callers either get a channel that
            // still receives the result, or they start a new flight.
            drop(guard);
            sender.send(result).ok();
        });

        channel
    }
}

async fn synthesize_and_store(
    cache: ClipCache,
    key: CacheKey,
    text: String,
    language_code: String,
    synthesizer: Arc<dyn Synthesizer>,
    timeout: Duration,
) -> Result<Bytes, CacheError> {
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, synthesizer.synthesize(&text, &language_code)).await;

    let audio = match result {
        Ok(Ok(audio)) => audio,
        Ok(Err(err)) => {
            tracing::warn!(
                error = &err as &dyn Error,
                cache_key = %key,
                %language_code,
                "Synthesis failed"
            );
            metric!(counter("clips.synthesis") += 1, "status" => "error");
            return Err(err.into());
        }
        Err(_) => {
            tracing::warn!(cache_key = %key, ?timeout, "Synthesis timed out");
            metric!(counter("clips.synthesis") += 1, "status" => "timeout");
            return Err(CacheError::Timeout(timeout));
        }
    };
    metric!(counter("clips.synthesis") += 1, "status" => "ok");
    metric!(timer("clips.synthesis.duration") = start.elapsed());

    // A clip that could not be stored is still a clip, the caller gets it either way.
    match cache.insert(&key, &text, &language_code, audio.clone()).await {
        Ok(_) => {
            metric!(counter("clips.store.write") += 1, "status" => "ok");
        }
        Err(err) => {
            tracing::error!(
                error = &err as &dyn Error,
                cache_key = %key,
                "Failed to store synthesized clip"
            );
            metric!(counter("clips.store.write") += 1, "status" => "error");
        }
    }

    Ok(audio)
}
