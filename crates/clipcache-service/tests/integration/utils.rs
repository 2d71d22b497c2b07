use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Notify, Semaphore};

use clipcache_service::caching::{Store, SynthesisError};
use clipcache_service::config::Config;
use clipcache_service::services::{ClipService, Synthesizer};

pub use clipcache_test::{setup, tempdir};

/// Deterministic audio for a piece of text, as produced by a default [`TestSynthesizer`].
pub fn audio_for(text: &str, language_code: &str) -> Bytes {
    sized_audio_for(text, language_code, 4096)
}

pub fn sized_audio_for(text: &str, language_code: &str, len: usize) -> Bytes {
    let seed = text
        .bytes()
        .chain(language_code.bytes())
        .fold(7u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    clipcache_test::fake_audio(len, seed).into()
}

pub fn config(path: &Path) -> Config {
    let mut config = Config::default();
    config.database.path = path.join("cache.db");
    config.fetch.synthesis_timeout = Duration::from_secs(10);
    config
}

/// Creates a service over a fresh store in `dir`.
pub fn service(dir: &Path, synthesizer: Arc<TestSynthesizer>) -> ClipService {
    service_with(config(dir), synthesizer)
}

pub fn service_with(config: Config, synthesizer: Arc<TestSynthesizer>) -> ClipService {
    ClipService::create(&config, synthesizer).unwrap()
}

pub fn in_memory_service(config: &Config, synthesizer: Arc<TestSynthesizer>) -> ClipService {
    ClipService::with_store(Store::in_memory().unwrap(), config, synthesizer)
}

/// A synthesizer that counts calls and can be slowed down, held back, or made to fail.
#[derive(Debug, Default)]
pub struct TestSynthesizer {
    calls: AtomicUsize,
    audio_len: Option<usize>,
    delay: Duration,
    failing_text: Option<&'static str>,
    gate: Option<Arc<Semaphore>>,
    started: Notify,
}

impl TestSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces clips of `len` bytes instead of the default size.
    pub fn with_audio_len(mut self, len: usize) -> Self {
        self.audio_len = Some(len);
        self
    }

    /// Every call takes at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Calls for exactly this text fail.
    pub fn failing_on(mut self, text: &'static str) -> Self {
        self.failing_text = Some(text);
        self
    }

    /// Calls block until a permit is added to `gate`, forever if none ever is.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resolves once a call has started.
    pub async fn started(&self) {
        self.started.notified().await
    }
}

impl Synthesizer for TestSynthesizer {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        language_code: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, SynthesisError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        async move {
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing_text == Some(text) {
                return Err(SynthesisError::new(format!("provider rejected {text:?}")));
            }
            match self.audio_len {
                Some(len) => Ok(sized_audio_for(text, language_code, len)),
                None => Ok(audio_for(text, language_code)),
            }
        }
        .boxed()
    }
}
