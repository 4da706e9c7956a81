//! A deliberately small in-memory MVCC storage engine.
//!
//! This crate is the storage collaborator of the notification core: it
//! provides versioned snapshots of a set of object tables, a retained
//! transaction log which can be replayed between any two versions with
//! observer callbacks, single-writer write transactions, and handover
//! envelopes for moving per-version state between threads.
//!
//! It is *not* a durability layer: nothing is written to disk, and the log
//! is retained from the first version so that a handle can be materialized
//! at any point in history.

mod error;
mod log_ops;
mod query;
mod store;
mod table;
mod value;

pub use error::StoreError;
pub use log_ops::{LogOp, NullObserver, ReplayObserver};
pub use query::{Filter, Handover, Query, SortColumn, SortOrder, TableView};
pub use store::{SharedStore, StoreHandle, Version};
pub use table::Table;
pub use value::{ColumnKind, ColumnSpec, TableSpec, Value};
