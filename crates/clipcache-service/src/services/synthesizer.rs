use bytes::Bytes;
use futures::future::BoxFuture;

use crate::caching::SynthesisError;

/// Produces audio for text that is not cached yet.
///
/// Implementations talk to a remote text-to-speech provider. The clip cache guarantees that at
/// most one call per distinct clip is in progress at any time, and bounds every call with the
/// configured synthesis timeout.
pub trait Synthesizer: Send + Sync + 'static {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        language_code: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, SynthesisError>>;
}
