use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to open transcript: {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read transcript: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ParseError {
    /// True when the transcript file does not exist.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Open { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session {session_id} is already active")]
    AlreadyActive { session_id: String },

    #[error("No registry entry for session {session_id}")]
    UnknownSession { session_id: String },

    #[error("Session {session_id} has already ended")]
    AlreadyClosed { session_id: String },

    #[error("Failed to write registry record")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create directory: {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open file: {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write file: {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read file: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to replace {path}")]
    Rename {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode record")]
    Encode(#[from] serde_json::Error),
}
