use crate::{ColumnKind, StoreError, StoreHandle, Value, Version};

/// A declarative row predicate over one value column. Being plain data, a
/// filter can cross threads freely inside a [`Handover`] envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    Eq { col: usize, value: Value },
    Ne { col: usize, value: Value },
    Gt { col: usize, value: Value },
    Lt { col: usize, value: Value },
}

impl Filter {
    fn matches(&self, actual: &Value) -> bool {
        match self {
            Filter::Eq { value, .. } => actual == value,
            Filter::Ne { value, .. } => actual != value,
            Filter::Gt { value, .. } => actual > value,
            Filter::Lt { value, .. } => actual < value,
        }
    }

    fn col(&self) -> usize {
        match *self {
            Filter::Eq { col, .. } | Filter::Ne { col, .. } | Filter::Gt { col, .. } | Filter::Lt { col, .. } => col,
        }
    }
}

/// A query over one table: every row, optionally narrowed by a [`Filter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub table: usize,
    pub filter: Option<Filter>,
}

impl Query {
    pub fn all(table: usize) -> Self {
        Self { table, filter: None }
    }

    pub fn filtered(table: usize, filter: Filter) -> Self {
        Self {
            table,
            filter: Some(filter),
        }
    }

    /// Materialize the matching rows, in table order.
    pub fn run(&self, handle: &StoreHandle) -> Result<TableView, StoreError> {
        let table = handle.table(self.table)?;
        let mut rows = Vec::new();
        for row in 0..table.row_count() {
            let keep = match &self.filter {
                None => true,
                Some(filter) => filter.matches(table.value(row, filter.col())?),
            };
            if keep {
                rows.push(row);
            }
        }
        Ok(TableView {
            table: self.table,
            rows,
            synced_version: table.version(),
        })
    }

    /// The version counter of the queried table, used to detect that a
    /// rerun cannot produce a different view.
    pub fn table_version(&self, handle: &StoreHandle) -> Result<u64, StoreError> {
        Ok(handle.table(self.table)?.version())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortColumn {
    pub col: usize,
    pub ascending: bool,
}

/// A lexicographic sort order over value columns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortOrder {
    pub columns: Vec<SortColumn>,
}

impl SortOrder {
    pub fn by(col: usize, ascending: bool) -> Self {
        Self {
            columns: vec![SortColumn { col, ascending }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A materialized sequence of row indices produced by a [`Query`] (or taken
/// from a link list), pinned to the version of the handle that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableView {
    table: usize,
    rows: Vec<usize>,
    synced_version: u64,
}

impl TableView {
    pub fn table(&self) -> usize {
        self.table
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The queried table's mutation counter at materialization time.
    pub fn synced_version(&self) -> u64 {
        self.synced_version
    }

    /// Stable-sort the view by the given order. Rows comparing equal keep
    /// their table order.
    pub fn sort(&mut self, handle: &StoreHandle, order: &SortOrder) -> Result<(), StoreError> {
        let table = handle.table(self.table)?;
        for sort_col in &order.columns {
            if !matches!(table.column_kind(sort_col.col)?, ColumnKind::Value) {
                return Err(StoreError::ColumnKindMismatch {
                    table: self.table,
                    col: sort_col.col,
                });
            }
        }
        let mut error = None;
        self.rows.sort_by(|&a, &b| {
            use std::cmp::Ordering;
            for sort_col in &order.columns {
                let (left, right) = match (table.value(a, sort_col.col), table.value(b, sort_col.col)) {
                    (Ok(l), Ok(r)) => (l, r),
                    (Err(e), _) | (_, Err(e)) => {
                        error.get_or_insert(e);
                        return Ordering::Equal;
                    }
                };
                let ordering = if sort_col.ascending {
                    left.cmp(right)
                } else {
                    right.cmp(left)
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// An envelope carrying per-version state between threads. Importing fails
/// unless the receiving handle is pinned at exactly the exported version.
#[derive(Clone, Debug)]
pub struct Handover<T> {
    payload: T,
    version: Version,
}

impl<T> Handover<T> {
    pub fn new(payload: T, version: Version) -> Self {
        Self { payload, version }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn into_payload(self) -> T {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ColumnSpec, NullObserver, SharedStore, TableSpec};
    use pretty_assertions::assert_eq;

    fn store_with_rows(values: &[i64]) -> crate::StoreHandle {
        let store = SharedStore::new(vec![TableSpec::new("n", vec![ColumnSpec::value("v")])]);
        let mut handle = store.handle();
        handle.begin_write(&mut NullObserver).unwrap();
        for &v in values {
            let row = handle.insert_row(0).unwrap();
            handle.set_value(0, row, 0, Value::Int(v)).unwrap();
        }
        handle.commit().unwrap();
        handle
    }

    #[test]
    fn filters_narrow_the_view() {
        let handle = store_with_rows(&[5, 1, 9, 5]);
        let view = Query::all(0).run(&handle).unwrap();
        assert_eq!(view.rows(), [0, 1, 2, 3]);

        let view = Query::filtered(0, Filter::Eq { col: 0, value: Value::Int(5) })
            .run(&handle)
            .unwrap();
        assert_eq!(view.rows(), [0, 3]);

        let view = Query::filtered(0, Filter::Gt { col: 0, value: Value::Int(4) })
            .run(&handle)
            .unwrap();
        assert_eq!(view.rows(), [0, 2, 3]);
    }

    #[test]
    fn sort_is_stable_over_table_order() {
        let handle = store_with_rows(&[5, 1, 9, 5]);
        let mut view = Query::all(0).run(&handle).unwrap();
        view.sort(&handle, &SortOrder::by(0, true)).unwrap();
        assert_eq!(view.rows(), [1, 0, 3, 2]);

        view.sort(&handle, &SortOrder::by(0, false)).unwrap();
        assert_eq!(view.rows(), [2, 0, 3, 1]);
    }
}
