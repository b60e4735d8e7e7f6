use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to open connection: {0}")]
    Open(String),
    #[error("failed to read response: {0}")]
    Read(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("image of {size} bytes does not fit the update partition ({capacity} bytes)")]
    TooLarge { size: u64, capacity: u64 },
    #[error("failed to begin flash write: {0}")]
    Begin(String),
    #[error("failed writing image data: {0}")]
    Write(String),
    #[error("short flash write ({written} of {requested} bytes)")]
    ShortWrite { written: usize, requested: usize },
    #[error("failed finalizing image: {0}")]
    Finalize(String),
}

/// Reasons a single fetch attempt is discarded and retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("response has no usable content length")]
    MissingContentLength,
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("malformed release metadata: {0}")]
    Malformed(String),
    #[error("release metadata has no tag_name")]
    MissingTag,
    #[error("connection closed after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("network unavailable after reconnect attempt")]
    ConnectivityUnavailable,
    #[error("fetch failed: {0}")]
    TransientFetchFailure(#[from] FetchFailure),
    #[error("flash transaction failed: {0}")]
    FlashTransactionFailure(#[from] FlashError),
    #[error("no data received for {idle_ms} ms")]
    StallTimeout { idle_ms: u64 },
}

impl From<TransportError> for OtaError {
    fn from(err: TransportError) -> Self {
        Self::TransientFetchFailure(FetchFailure::Transport(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("release unresolvable: {cause}")]
pub struct Unresolvable {
    pub cause: OtaError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("firmware install failed after {attempts} attempt(s): {last_error}")]
pub struct InstallFailure {
    pub attempts: u32,
    pub last_error: OtaError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("sensor not present")]
    NotPresent,
    #[error("sensor read failed: {0}")]
    Read(String),
}
