use thiserror::Error;

/// Malformed bytes, either straight off the wire or out of the message cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed forward message: {0}")]
    Malformed(String),
    #[error("failed to decode forward message (hash={hash}): {reason}")]
    Cached { hash: String, reason: String },
    #[error("failed to encode forward message: {0}")]
    Encode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reference message has no metadata (ref_hash={ref_hash})")]
    MissingMetadata { ref_hash: String },
    #[error("delta message has no metadata (hash={hash})")]
    DeltaWithoutMetadata { hash: String },
    #[error("delta received before any new_session (hash={hash})")]
    NoActiveEpoch { hash: String },
    #[error("invalid delta path {path:?}: {reason}")]
    InvalidPath { path: Vec<u32>, reason: String },
    #[error("fetched message for hash={hash} is itself a reference")]
    NestedReference { hash: String },
    #[error("reference message reached the tree unresolved (ref_hash={ref_hash})")]
    UnresolvedReference { ref_hash: String },
}

impl ProtocolError {
    pub(crate) fn invalid_path(path: &[u32], reason: impl Into<String>) -> Self {
        ProtocolError::InvalidPath {
            path: path.to_vec(),
            reason: reason.into(),
        }
    }
}

/// The backend could not hand over a cached message on a cache miss.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to fetch cached forward message (hash={hash}): {reason}")]
pub struct FetchError {
    pub hash: String,
    pub reason: String,
}

impl FetchError {
    pub fn new(hash: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            reason: reason.into(),
        }
    }
}

/// Everything that can go wrong while processing one inbound message.
///
/// None of these are fatal to the connection; the caller drops the message
/// and moves on to the next frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Decode(_) => "decode_error",
            EngineError::Protocol(_) => "protocol_error",
            EngineError::Fetch(_) => "fetch_error",
        }
    }
}
