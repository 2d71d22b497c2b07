//! Speech synthesis with the Azure text-to-speech REST API.
//!
//! The voice for a language is resolved in this order:
//!
//!  1. a configured voice for the exact language code,
//!  2. the service's default neural voice for the exact locale,
//!  3. a configured voice for the base language (`en` for `en-AU`),
//!  4. the service's default neural voice of any locale sharing the base language.
//!
//! The service's voice list is only requested when a configured voice does not match exactly,
//! and is kept for the lifetime of the synthesizer once it loaded successfully.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::caching::SynthesisError;
use crate::config::AzureConfig;
use crate::utils::rate_limit::RateLimiter;

use super::synthesizer::Synthesizer;

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const OUTPUT_FORMAT_HEADER: &str = "X-Microsoft-OutputFormat";
const USER_AGENT: &str = concat!("clipcache/", env!("CARGO_PKG_VERSION"));

/// A voice as advertised by the voice list endpoint.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Voice {
    pub short_name: String,
    pub locale: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub voice_type: String,
}

/// The default voice of every locale the service supports.
#[derive(Clone, Debug, Default)]
pub struct VoiceIndex {
    by_locale: BTreeMap<String, Voice>,
}

impl VoiceIndex {
    /// Picks one neural voice per locale, preferring the first female voice.
    pub fn from_voices(voices: impl IntoIterator<Item = Voice>) -> Self {
        let mut by_locale: BTreeMap<String, Voice> = BTreeMap::new();

        for voice in voices {
            if voice.voice_type != "Neural" {
                continue;
            }
            match by_locale.get(&voice.locale) {
                Some(current) if current.gender == "Female" || voice.gender != "Female" => {}
                _ => {
                    by_locale.insert(voice.locale.clone(), voice);
                }
            }
        }

        Self { by_locale }
    }

    /// Number of locales with a voice.
    pub fn len(&self) -> usize {
        self.by_locale.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_locale.is_empty()
    }

    /// All default voices, ordered by locale.
    pub fn iter(&self) -> impl Iterator<Item = &Voice> {
        self.by_locale.values()
    }

    /// The default voice for exactly `locale`.
    pub fn exact(&self, locale: &str) -> Option<&str> {
        self.by_locale
            .get(locale)
            .map(|voice| voice.short_name.as_str())
    }

    /// The default voice of the first locale, in sorted order, that speaks `base`.
    pub fn for_base_language(&self, base: &str) -> Option<&str> {
        self.by_locale
            .iter()
            .find(|(locale, _)| locale.as_str() == base || base_language(locale) == Some(base))
            .map(|(_, voice)| voice.short_name.as_str())
    }
}

/// The language part of a code like `en-US`, if the code has a region.
fn base_language(language_code: &str) -> Option<&str> {
    language_code
        .split_once('-')
        .map(|(base, _)| base)
        .filter(|base| !base.is_empty())
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn build_ssml(text: &str, language_code: &str, voice: &str) -> String {
    let language_code = escape_xml(language_code);
    format!(
        "<speak version='1.0' xml:lang='{language_code}'><voice xml:lang='{language_code}' name='{}'>{}</voice></speak>",
        escape_xml(voice),
        escape_xml(text),
    )
}

/// Reads the body of a failed response for the error message.
async fn error_for_status(response: reqwest::Response, what: &str) -> SynthesisError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    SynthesisError::new(format!(
        "{what} failed with status {status}: {}",
        body.trim()
    ))
}

/// A [`Synthesizer`] backed by the Azure speech service.
///
/// Requests are spaced to the configured rate across all concurrent callers.
#[derive(Debug)]
pub struct AzureSynthesizer {
    client: reqwest::Client,
    base_url: String,
    subscription_key: String,
    output_format: String,
    custom_voices: BTreeMap<String, String>,
    limiter: RateLimiter,
    voices: OnceCell<VoiceIndex>,
}

impl AzureSynthesizer {
    pub fn new(config: &AzureConfig) -> Result<Self, SynthesisError> {
        if config.subscription_key.trim().is_empty() {
            return Err(SynthesisError::new("azure subscription key must not be empty"));
        }
        if config.region.trim().is_empty() && config.endpoint.is_none() {
            return Err(SynthesisError::new("azure region must not be empty"));
        }

        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .user_agent(USER_AGENT)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| SynthesisError::with_source("failed to create HTTP client", err))?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            subscription_key: config.subscription_key.clone(),
            output_format: config.output_format.clone(),
            custom_voices: config.voices.clone(),
            limiter: RateLimiter::new(config.effective_max_qps()),
            voices: OnceCell::new(),
        })
    }

    /// The service's default voices, loading them on first use.
    ///
    /// A failed load is not remembered and is retried by the next call.
    pub async fn voices(&self) -> Result<&VoiceIndex, SynthesisError> {
        self.voices.get_or_try_init(|| self.load_voices()).await
    }

    async fn load_voices(&self) -> Result<VoiceIndex, SynthesisError> {
        let response = self
            .client
            .get(format!("{}/cognitiveservices/voices/list", self.base_url))
            .header(SUBSCRIPTION_KEY_HEADER, &self.subscription_key)
            .send()
            .await
            .map_err(|err| SynthesisError::with_source("failed to fetch voice list", err))?;

        if !response.status().is_success() {
            return Err(error_for_status(response, "voice list request").await);
        }

        let voices: Vec<Voice> = response
            .json()
            .await
            .map_err(|err| SynthesisError::with_source("failed to parse voice list", err))?;
        let total = voices.len();
        let index = VoiceIndex::from_voices(voices);

        tracing::info!(
            voices = total,
            locales = index.len(),
            "Loaded Azure voice list"
        );
        Ok(index)
    }

    /// Resolves the voice to speak `language_code` with.
    async fn voice_for(&self, language_code: &str) -> Result<String, SynthesisError> {
        if let Some(voice) = self.custom_voices.get(language_code) {
            return Ok(voice.clone());
        }

        let voices = self.voices().await?;
        if let Some(voice) = voices.exact(language_code) {
            return Ok(voice.to_owned());
        }

        if let Some(base) = base_language(language_code) {
            if let Some(voice) = self.custom_voices.get(base) {
                return Ok(voice.clone());
            }
            if let Some(voice) = voices.for_base_language(base) {
                return Ok(voice.to_owned());
            }
        }

        Err(SynthesisError::new(format!(
            "no voice available for language code: {language_code}"
        )))
    }

    async fn synthesize_ssml(
        &self,
        text: &str,
        language_code: &str,
    ) -> Result<Bytes, SynthesisError> {
        let voice = self.voice_for(language_code).await?;
        let ssml = build_ssml(text, language_code, &voice);

        let waited = self.limiter.acquire().await;
        if !waited.is_zero() {
            metric!(timer("clips.azure.throttled") = waited);
        }

        let start = Instant::now();
        let response = self
            .client
            .post(format!("{}/cognitiveservices/v1", self.base_url))
            .header(SUBSCRIPTION_KEY_HEADER, &self.subscription_key)
            .header(CONTENT_TYPE, "application/ssml+xml")
            .header(OUTPUT_FORMAT_HEADER, &self.output_format)
            .body(ssml)
            .send()
            .await
            .map_err(|err| SynthesisError::with_source("synthesis request failed", err))?;

        let status = response.status();
        metric!(counter("clips.azure.requests") += 1, "status" => status.as_str());
        if status != StatusCode::OK {
            return Err(error_for_status(response, "synthesis request").await);
        }

        let audio = response
            .bytes()
            .await
            .map_err(|err| SynthesisError::with_source("failed to read synthesized audio", err))?;
        metric!(timer("clips.azure.duration") = start.elapsed());

        if audio.is_empty() {
            return Err(SynthesisError::new("synthesis produced no audio data"));
        }

        tracing::debug!(%voice, language_code, size = audio.len(), "Synthesized clip");
        Ok(audio)
    }
}

impl Synthesizer for AzureSynthesizer {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        language_code: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, SynthesisError>> {
        self.synthesize_ssml(text, language_code).boxed()
    }
}
