use std::path::PathBuf;

use lodestone_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database at `{path}` is already open with a different {property}")]
    ConfigMismatch { path: PathBuf, property: &'static str },
    #[error("StoreError: {0}")]
    Store(#[from] StoreError),
    #[error("the target collection was destroyed before delivery")]
    TargetGone,
    #[error("background query failed: {0}")]
    QueryExecution(String),
    #[error("unsupported transaction log entry: {0}")]
    LogParse(String),
    #[error("notification channel I/O: {0}")]
    ChannelIo(#[from] std::io::Error),
    #[error("operation used from a thread other than the one it is bound to")]
    IncorrectThread,
    #[error("operation not allowed inside a write transaction")]
    InWriteTransaction,
    #[error("database was opened read-only")]
    ReadOnly,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
