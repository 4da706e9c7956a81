use std::path::PathBuf;

use lodestone_store::TableSpec;

/// Configuration for opening a database.
///
/// The first open of a path fixes its configuration; later opens of the
/// same path must agree on `read_only`, `in_memory` and `schema_version`
/// or they are rejected with [`Error::ConfigMismatch`](crate::Error).
#[derive(Clone, Debug)]
pub struct Config {
    pub path: PathBuf,
    pub schema: Vec<TableSpec>,
    pub schema_version: u64,
    pub read_only: bool,
    pub in_memory: bool,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>, schema: Vec<TableSpec>) -> Self {
        Self {
            path: path.into(),
            schema,
            schema_version: 0,
            read_only: false,
            in_memory: false,
        }
    }

    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }
}
