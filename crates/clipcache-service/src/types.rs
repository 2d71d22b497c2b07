//! Request and response types of the clip cache.

use bytes::Bytes;

/// One clip to fetch: the text to speak and the language to speak it in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClipRequest {
    pub text: String,
    pub language_code: String,
}

impl ClipRequest {
    pub fn new(text: impl Into<String>, language_code: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language_code: language_code.into(),
        }
    }
}

/// The audio for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedClip {
    /// Decoded audio, exactly as the synthesizer produced it.
    pub audio: Bytes,
    /// Hex cache key of the clip.
    pub key: String,
    /// Whether the audio was served from the store.
    ///
    /// `false` for every caller that waited on a synthesis, including callers that joined a
    /// synthesis started by someone else.
    pub cached: bool,
}

/// Result of a lookup that never synthesizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLookup {
    pub key: String,
    /// `None` if the clip is not stored.
    pub audio: Option<Bytes>,
}

/// Result of deleting a clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub key: String,
    /// Whether a clip existed.
    pub deleted: bool,
}
