use crate::{ColumnKind, StoreError, TableSpec, Value};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Cell {
    Value(Value),
    Link(Option<usize>),
    LinkList(Vec<usize>),
}

impl Cell {
    fn empty_for(kind: ColumnKind) -> Cell {
        match kind {
            ColumnKind::Value => Cell::Value(Value::Null),
            ColumnKind::Link { .. } => Cell::Link(None),
            ColumnKind::LinkList { .. } => Cell::LinkList(Vec::new()),
        }
    }
}

/// One object table: an ordered collection of rows whose shape is fixed by
/// a [`TableSpec`]. Row indices are the storage engine's row identity; they
/// are stable under mutation of *other* rows but not under deletion or
/// move-last-over of the row itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    spec: TableSpec,
    rows: Vec<Vec<Cell>>,
    // Bumped on every mutation; lets result views detect no-op reruns
    version: u64,
    index: usize,
}

impl Table {
    pub(crate) fn new(index: usize, spec: TableSpec) -> Self {
        Self {
            spec,
            rows: Vec::new(),
            version: 0,
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The table's index within the schema.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.spec.columns.len()
    }

    pub fn column_kind(&self, col: usize) -> Result<ColumnKind, StoreError> {
        self.spec
            .columns
            .get(col)
            .map(|c| c.kind)
            .ok_or(StoreError::NoSuchColumn {
                table: self.index,
                col,
            })
    }

    /// Every mutation of this table bumps the returned counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn value(&self, row: usize, col: usize) -> Result<&Value, StoreError> {
        match self.cell(row, col)? {
            Cell::Value(v) => Ok(v),
            _ => Err(self.kind_mismatch(col)),
        }
    }

    pub fn link(&self, row: usize, col: usize) -> Result<Option<usize>, StoreError> {
        match self.cell(row, col)? {
            Cell::Link(target) => Ok(*target),
            _ => Err(self.kind_mismatch(col)),
        }
    }

    pub fn link_list(&self, row: usize, col: usize) -> Result<&[usize], StoreError> {
        match self.cell(row, col)? {
            Cell::LinkList(targets) => Ok(targets),
            _ => Err(self.kind_mismatch(col)),
        }
    }

    // ------------------------------------------------------------------
    // Mutation: called from write transactions and log replay only.

    pub(crate) fn insert_rows(&mut self, count: usize) {
        self.version += 1;
        for _ in 0..count {
            self.rows
                .push(self.spec.columns.iter().map(|c| Cell::empty_for(c.kind)).collect());
        }
    }

    pub(crate) fn erase_row(&mut self, row: usize) -> Result<(), StoreError> {
        self.check_row(row)?;
        self.version += 1;
        self.rows.remove(row);
        Ok(())
    }

    pub(crate) fn move_last_over(&mut self, row: usize) -> Result<(), StoreError> {
        self.check_row(row)?;
        self.version += 1;
        let last = self.rows.pop().expect("check_row verified non-empty");
        if row < self.rows.len() {
            self.rows[row] = last;
        }
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.version += 1;
        self.rows.clear();
    }

    pub(crate) fn set_value(&mut self, row: usize, col: usize, value: Value) -> Result<(), StoreError> {
        self.version += 1;
        let mismatch = self.kind_mismatch(col);
        match self.cell_mut(row, col)? {
            Cell::Value(v) => {
                *v = value;
                Ok(())
            }
            _ => Err(mismatch),
        }
    }

    pub(crate) fn set_link(&mut self, row: usize, col: usize, target: Option<usize>) -> Result<(), StoreError> {
        self.version += 1;
        let mismatch = self.kind_mismatch(col);
        match self.cell_mut(row, col)? {
            Cell::Link(t) => {
                *t = target;
                Ok(())
            }
            _ => Err(mismatch),
        }
    }

    pub(crate) fn list_mut(&mut self, row: usize, col: usize) -> Result<&mut Vec<usize>, StoreError> {
        self.version += 1;
        let mismatch = self.kind_mismatch(col);
        match self.cell_mut(row, col)? {
            Cell::LinkList(targets) => Ok(targets),
            _ => Err(mismatch),
        }
    }

    // ------------------------------------------------------------------

    fn cell(&self, row: usize, col: usize) -> Result<&Cell, StoreError> {
        self.check_row(row)?;
        self.rows[row].get(col).ok_or(StoreError::NoSuchColumn {
            table: self.index,
            col,
        })
    }

    fn cell_mut(&mut self, row: usize, col: usize) -> Result<&mut Cell, StoreError> {
        self.check_row(row)?;
        let table = self.index;
        self.rows[row]
            .get_mut(col)
            .ok_or(StoreError::NoSuchColumn { table, col })
    }

    fn check_row(&self, row: usize) -> Result<(), StoreError> {
        if row < self.rows.len() {
            Ok(())
        } else {
            Err(StoreError::NoSuchRow {
                table: self.index,
                row,
            })
        }
    }

    fn kind_mismatch(&self, col: usize) -> StoreError {
        StoreError::ColumnKindMismatch {
            table: self.index,
            col,
        }
    }
}
