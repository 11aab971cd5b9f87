use thiserror::Error;

/// Error kinds for the discovery engines, per the error-handling design:
/// `TransientIO` aborts a round without checkpoint advance, `MalformedRecord`
/// drops the offending record and continues, `PolicyConflict` retries once
/// then escalates to `TransientIO`, `ConfigError` fails startup, and
/// `NotOnboarded` surfaces straight to the RPC caller.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("transient I/O error: {0}")]
    TransientIO(String),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("policy conflict: {0}")]
    PolicyConflict(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("cluster not onboarded: {0}")]
    NotOnboarded(String),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

impl DiscoveryError {
    /// Whether this error should abort the current round without
    /// advancing its checkpoint.
    pub fn aborts_round(&self) -> bool {
        matches!(self, DiscoveryError::TransientIO(_))
    }
}
