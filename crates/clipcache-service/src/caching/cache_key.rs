use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use sha2::{Digest, Sha256};

/// The identity of a stored clip.
///
/// A key is derived from the language code and the [normalized](normalize_text) text, so
/// requests that only differ in casing, whitespace or trailing punctuation share one clip.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Derives the key for `text` spoken in `language_code`.
    pub fn for_clip(text: &str, language_code: &str) -> Self {
        let metadata = format!("{language_code}:{}", normalize_text(text));
        let hash = Sha256::digest(metadata.as_bytes());

        CacheKey {
            metadata: metadata.into(),
            hash: hash.into(),
        }
    }

    /// Returns the human-readable input that was hashed, `language:normalized text`.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// The lowercase hex digest, which is what the store uses as primary key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Any run of Unicode punctuation (`P*`) and whitespace at the end of the text.
static TRAILING_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{P}\s]+$").unwrap());

/// Normalizes text so that trivially different spellings map to the same clip.
///
/// The text is lowercased, runs of whitespace collapse into single spaces, and punctuation
/// and whitespace are stripped from the end. Punctuation inside the text is kept.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();

    let mut normalized = String::with_capacity(lowered.len());
    for word in lowered.split_whitespace() {
        if !normalized.is_empty() {
            normalized.push(' ');
        }
        normalized.push_str(word);
    }

    match TRAILING_PUNCTUATION.find(&normalized) {
        Some(trailing) => normalized[..trailing.start()].to_owned(),
        None => normalized,
    }
}
