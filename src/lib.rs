pub mod cleaner;
pub mod partition;
pub mod storage;

pub use partition::TopicPartition;

use cleaner::state::{CleaningEvent, LogCleaningState};
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Serialization(bincode::Error),
    ChecksumMismatch,
    /// A cleaning callback or request hit a state it does not own.
    InvalidStateTransition {
        partition: TopicPartition,
        state: Option<LogCleaningState>,
        event: CleaningEvent,
    },
    CleaningAborted(TopicPartition),
    UnknownPartition(TopicPartition),
    CorruptCheckpoint(String),
    LogDirOffline(PathBuf),
    InvalidConfig(String),
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::InvalidStateTransition {
                partition,
                state,
                event,
            } => match state {
                Some(state) => write!(
                    f,
                    "Invalid cleaning state transition for {}: cannot apply {:?} in state {}",
                    partition, event, state
                ),
                None => write!(
                    f,
                    "Invalid cleaning state transition for {}: cannot apply {:?} while idle",
                    partition, event
                ),
            },
            Error::CleaningAborted(tp) => write!(f, "Cleaning of {} was aborted", tp),
            Error::UnknownPartition(tp) => write!(f, "Unknown partition {}", tp),
            Error::CorruptCheckpoint(s) => write!(f, "Corrupt checkpoint: {}", s),
            Error::LogDirOffline(dir) => write!(f, "Log directory {:?} is offline", dir),
            Error::InvalidConfig(s) => write!(f, "Invalid configuration: {}", s),
            Error::Internal(s) => write!(f, "Internal error: {}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e)
    }
}
