// src/error.rs
use std::net::AddrParseError;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the toil library.
#[derive(Debug, Error)]
pub enum Error {
    /// Merging CLI, file, environment, and defaults failed.
    #[error("invalid configuration: {0}")]
    Config(Box<figment::Error>),

    /// The configured listen address is not a valid socket address.
    #[error("invalid listen address {addr:?}: {source}")]
    InvalidAddr {
        addr: String,
        #[source]
        source: AddrParseError,
    },

    /// The directory to serve does not exist or is not a directory.
    #[error("serve root {0:?} is not a directory")]
    RootNotDirectory(PathBuf),

    /// The hub task has stopped and no longer accepts events.
    #[error("hub is no longer running")]
    HubClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

/// Why a write to a push socket did not complete.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write did not complete within {0:?}")]
    Deadline(Duration),

    #[error("socket write failed: {0}")]
    Socket(String),
}
