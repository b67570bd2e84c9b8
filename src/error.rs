//! Error types for herder

/// Result type alias for herder operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for herder
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Compare-and-swap conflict on a Cfg key
    #[error("cas mismatch: expected {expected}, got {actual}")]
    CasMismatch { expected: u64, actual: u64 },
    /// This node's metadata schema version is older than the cluster's
    #[error("version too low: {0}")]
    VersionTooLow(String),
    /// Distinguished sentinel; an index definition vanished mid-operation
    #[error("no index definition found")]
    NoIndexDefinition,
    /// A covering set could not be assembled for all partitions
    #[error("missing partitions: {0:?}")]
    MissingPartitions(Vec<String>),
    /// Network or Cfg transport failure
    #[error("transport error: {0}")]
    Transport(String),
    /// JSON parse or schema failure on stored metadata
    #[error("malformed config: {0}")]
    MalformedConfig(String),
    /// A bounded CAS retry loop gave up
    #[error("too many retries: {0}")]
    TooManyRetries(String),
    /// A stop channel was closed while an operation was in flight
    #[error("stopped")]
    Stopped,
    /// An index partition's stored files are unusable and should be rebuilt
    #[error("corrupt pindex: {0}")]
    CorruptPIndex(String),
    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error is a CAS conflict that a retry loop may absorb.
    pub fn is_cas_mismatch(&self) -> bool {
        matches!(self, Error::CasMismatch { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedConfig(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
