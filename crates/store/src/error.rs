use thiserror::Error;

use crate::store::Version;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("handle is at version {actual:?} but version {expected:?} is required")]
    VersionMismatch { expected: Version, actual: Version },
    #[error("version {0:?} has not been committed yet")]
    UnknownVersion(Version),
    #[error("no table at index {0}")]
    NoSuchTable(usize),
    #[error("no column at index {col} in table {table}")]
    NoSuchColumn { table: usize, col: usize },
    #[error("no row {row} in table {table}")]
    NoSuchRow { table: usize, row: usize },
    #[error("column {col} of table {table} has a different kind than the operation requires")]
    ColumnKindMismatch { table: usize, col: usize },
    #[error("a write transaction is already in progress on this handle")]
    WriteInProgress,
    #[error("not in a write transaction")]
    NotInWrite,
    #[error("transaction log contains an operation the observer does not support")]
    UnsupportedLogOp,
}
