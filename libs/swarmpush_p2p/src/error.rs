use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds of the piece-exchange engine.
///
/// Per-peer errors ([`Error::Protocol`], transient socket errors surfaced as
/// [`Error::Io`] by a connection task) stay inside the peer task and reach the
/// session planner as events; session-fatal errors end up in a terminal
/// status report.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("piece {index} failed verification")]
    HashMismatch { index: u32 },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid metainfo: {0}")]
    InvalidMetaInfo(String),

    #[error("task {0} already exists")]
    TaskExist(String),

    #[error("task {0} does not exist")]
    TaskNotExist(String),

    #[error("engine is shutting down")]
    Shutdown,

    #[error("status report: {0}")]
    Report(#[from] reqwest::Error),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
