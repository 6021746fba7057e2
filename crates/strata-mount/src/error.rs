use std::io;

use thiserror::Error;

use strata_store::StoreError;

/// Errors that can occur in the staged-mutation layer
#[derive(Error, Debug)]
pub enum MountError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("tree entry for {0} is missing basic attributes")]
    MissingAttrs(String),

    #[error("{0} is not a directory")]
    NotDirectory(String),

    #[error("start_write must be called before staging mutations")]
    NoWriteInProgress,

    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, MountError>;
