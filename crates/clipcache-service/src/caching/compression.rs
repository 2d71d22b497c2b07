use std::fmt;
use std::io;

use thiserror::Error;

/// The algorithm a stored payload is encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    /// Raw audio, as produced by the synthesizer.
    #[default]
    None,
    /// A single zstd frame.
    Zstd,
}

impl Compression {
    /// Parses the marker stored alongside a payload.
    ///
    /// Rows written before compression existed carry no marker at all.
    pub fn from_marker(marker: Option<&str>) -> Result<Self, CodecError> {
        match marker {
            None | Some("none") => Ok(Self::None),
            Some("zstd") => Ok(Self::Zstd),
            Some(other) => Err(CodecError::UnknownAlgorithm(other.to_owned())),
        }
    }

    /// The marker to store, `None` for uncompressed payloads.
    pub fn marker(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Zstd => Some("zstd"),
        }
    }

    pub fn is_compressed(self) -> bool {
        self != Self::None
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker().unwrap_or("none"))
    }
}

/// An error encoding or decoding a stored payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to compress payload")]
    Encode(#[source] io::Error),
    /// The payload does not match the algorithm it is declared with.
    #[error("payload is not valid {algorithm} data")]
    Decode {
        algorithm: Compression,
        #[source]
        source: io::Error,
    },
    #[error("unknown compression algorithm `{0}`")]
    UnknownAlgorithm(String),
}

/// Compresses payloads on the write path and decompresses them on the read path.
///
/// Decoding never depends on whether compression is currently enabled: a cache that had
/// compression turned off again still serves the clips it wrote while it was on.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    level: i32,
}

impl Default for Codec {
    fn default() -> Self {
        Self::zstd(zstd::DEFAULT_COMPRESSION_LEVEL)
    }
}

impl Codec {
    /// A zstd codec with the given compression level.
    pub fn zstd(level: i32) -> Self {
        Self { level }
    }

    /// The algorithm written by [`encode`](Self::encode).
    pub fn algorithm(&self) -> Compression {
        Compression::Zstd
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::bulk::compress(data, self.level).map_err(CodecError::Encode)
    }

    /// Decodes a payload stored with `algorithm`.
    ///
    /// There is no fallback to the raw bytes: a payload that does not decode is an error.
    pub fn decode(data: &[u8], algorithm: Compression) -> Result<Vec<u8>, CodecError> {
        match algorithm {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd => zstd::stream::decode_all(data)
                .map_err(|source| CodecError::Decode { algorithm, source }),
        }
    }
}
