use thiserror::Error;

/// Errors raised while encoding, decoding, or transforming records.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode record: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("unknown build state '{0}'")]
    UnknownState(String),

    #[error("detail '{kind}' is compressed but not text-encoded")]
    UnencodedCompression { kind: String },

    #[error("detail '{kind}' is not valid base64: {source}")]
    Base64 {
        kind: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("detail '{kind}' could not be (de)compressed: {source}")]
    Compression {
        kind: String,
        #[source]
        source: std::io::Error,
    },

    #[error("detail '{kind}' is not valid UTF-8 after decoding")]
    NotText { kind: String },
}

/// Result alias for proto operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
