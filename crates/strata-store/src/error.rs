use std::io;

use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt pack: {0}")]
    CorruptPack(String),

    #[error("corrupt metadata log: {0}")]
    CorruptLog(String),

    #[error("refcount for {hash} would go negative")]
    NegativeRefcount { hash: String },

    #[error("unknown object kind: {0}")]
    UnknownKind(u32),

    #[error("object not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
