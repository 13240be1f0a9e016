use thiserror::Error;

/// Fatal errors raised while building the notification machinery.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

/// Recoverable registration failures returned by `WaitSet::acquire`.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash)]
pub enum WaitSetError {
    #[error("trigger vector overflow: waitset is at capacity")]
    TriggerVectorOverflow,
    #[error("trigger already acquired: identical origin, trigger id and callback")]
    TriggerAlreadyAcquired,
}

pub type Result<T> = std::result::Result<T, Error>;
