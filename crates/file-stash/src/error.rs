//! Error types for the file stash

use std::fmt;

#[derive(Debug)]
pub enum StashError {
    /// The entropy source could not produce an identifier
    Allocation(String),
    /// Writing an upload to disk failed; nothing was kept
    Write(Box<std::io::Error>),
    /// The caller-supplied name cannot be used as a file name
    InvalidName(String),
    /// Removing an item's container failed; a later sweep retries
    Delete(Box<std::io::Error>),
    Io(Box<std::io::Error>),
}

impl StashError {
    pub(crate) fn write(err: std::io::Error) -> Self {
        StashError::Write(Box::new(err))
    }

    pub(crate) fn delete(err: std::io::Error) -> Self {
        StashError::Delete(Box::new(err))
    }
}

impl fmt::Display for StashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StashError::Allocation(msg) => write!(f, "Identifier allocation failed: {}", msg),
            StashError::Write(err) => write!(f, "Write error: {}", err),
            StashError::InvalidName(name) => write!(f, "Invalid item name: {:?}", name),
            StashError::Delete(err) => write!(f, "Delete error: {}", err),
            StashError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for StashError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StashError::Write(err) | StashError::Delete(err) | StashError::Io(err) => {
                Some(err.as_ref())
            }
            _ => None,
        }
    }
}

impl From<std::io::Error> for StashError {
    fn from(err: std::io::Error) -> Self {
        StashError::Io(Box::new(err))
    }
}

impl From<getrandom::Error> for StashError {
    fn from(err: getrandom::Error) -> Self {
        StashError::Allocation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StashError>;
