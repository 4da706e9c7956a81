use lodestone_changeset::IndexSet;
use lodestone_store::{ReplayObserver, StoreError};

/// The application-facing observation seam: a snapshot with a binding
/// context receives row- and column-granular change information whenever it
/// advances past other threads' commits.
///
/// `key` values are opaque identifiers chosen by the binding; they survive
/// row reordering (the parser tracks observed rows through erases and
/// move-last-over) and are reported in `invalidated` when the row dies.
pub trait BindingContext: Send + Sync {
    /// The rows the context wants column-level deltas for.
    fn observed_rows(&self) -> Vec<ObservedRow> {
        Vec::new()
    }

    /// Called after an advance has been computed, before callbacks run.
    fn will_change(&self, changed: &[RowChangeInfo], invalidated: &[u64]) {
        let _ = (changed, invalidated);
    }

    /// Called once the snapshot has moved to the new version.
    fn did_change(&self, changed: &[RowChangeInfo], invalidated: &[u64]) {
        let _ = (changed, invalidated);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObservedRow {
    pub key: u64,
    pub table: usize,
    pub row: usize,
}

/// How a list column changed. A plain value column reports `None` (the
/// column changed, with no index detail). Mixing different list operation
/// kinds degrades to `SetAll`, as only one kind can be reported per column
/// per advance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeltaKind {
    #[default]
    None,
    Set,
    Insert,
    Remove,
    SetAll,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDelta {
    pub col: usize,
    pub kind: DeltaKind,
    pub indices: IndexSet,
}

/// Column-level changes for one observed row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowChangeInfo {
    pub key: u64,
    pub table: usize,
    pub row: usize,
    pub columns: Vec<ColumnDelta>,
}

#[derive(Clone, Default)]
struct ColumnState {
    changed: bool,
    kind: DeltaKind,
    indices: IndexSet,
}

struct ObserverState {
    key: u64,
    table: usize,
    row: usize,
    columns: Vec<ColumnState>,
}

impl ObserverState {
    fn column(&mut self, col: usize) -> &mut ColumnState {
        if self.columns.len() <= col {
            self.columns.resize_with(col + 1, ColumnState::default);
        }
        &mut self.columns[col]
    }
}

/// Replay observer translating the transaction log into per-observer
/// per-column deltas for a [`BindingContext`].
pub(crate) struct BindingObserver {
    observers: Vec<ObserverState>,
    invalidated: Vec<u64>,
    current_table: usize,
    // The link list selected by the log, identified by observer key so
    // invalidations cannot leave a dangling reference
    active_list: Option<(u64, usize)>,
}

impl BindingObserver {
    pub(crate) fn new(observed: Vec<ObservedRow>) -> Self {
        Self {
            observers: observed
                .into_iter()
                .map(|o| ObserverState {
                    key: o.key,
                    table: o.table,
                    row: o.row,
                    columns: Vec::new(),
                })
                .collect(),
            invalidated: Vec::new(),
            current_table: 0,
            active_list: None,
        }
    }

    pub(crate) fn finish(self) -> (Vec<RowChangeInfo>, Vec<u64>) {
        let changed = self
            .observers
            .into_iter()
            .filter_map(|observer| {
                let columns: Vec<ColumnDelta> = observer
                    .columns
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.changed)
                    .map(|(col, c)| ColumnDelta {
                        col,
                        kind: c.kind,
                        indices: c.indices.clone(),
                    })
                    .collect();
                if columns.is_empty() {
                    return None;
                }
                Some(RowChangeInfo {
                    key: observer.key,
                    table: observer.table,
                    row: observer.row,
                    columns,
                })
            })
            .collect();
        (changed, self.invalidated)
    }

    fn mark_dirty(&mut self, row: usize, col: usize) {
        let table = self.current_table;
        for observer in &mut self.observers {
            if observer.table == table && observer.row == row {
                observer.column(col).changed = true;
            }
        }
    }

    fn invalidate(&mut self, index: usize) {
        let observer = self.observers.remove(index);
        if self.active_list.is_some_and(|(key, _)| key == observer.key) {
            self.active_list = None;
        }
        self.invalidated.push(observer.key);
    }

    fn active_column(&mut self) -> Option<&mut ColumnState> {
        let (key, col) = self.active_list?;
        let observer = self.observers.iter_mut().find(|o| o.key == key)?;
        Some(observer.column(col))
    }

    fn append_list_change(&mut self, kind: DeltaKind, index: usize) {
        let Some(column) = self.active_column() else {
            return;
        };
        if column.kind == DeltaKind::SetAll {
            // Already beyond per-index reporting
            return;
        }
        if column.kind == DeltaKind::None {
            column.kind = kind;
            column.changed = true;
            column.indices.add(index);
        } else if column.kind == kind {
            match kind {
                DeltaKind::Remove => {
                    column.indices.add_shifted(index);
                }
                DeltaKind::Insert => column.indices.insert_at(index, 1),
                _ => column.indices.add(index),
            }
        } else {
            // Only a single kind of change can be reported per column, so
            // collapse mixed changes to "everything changed"
            column.indices.set(0);
            column.kind = DeltaKind::SetAll;
        }
    }
}

impl ReplayObserver for BindingObserver {
    fn select_table(&mut self, table: usize) -> Result<(), StoreError> {
        self.current_table = table;
        Ok(())
    }

    fn erase_row(&mut self, row: usize) -> Result<(), StoreError> {
        let table = self.current_table;
        let mut i = 0;
        while i < self.observers.len() {
            if self.observers[i].table == table && self.observers[i].row == row {
                self.invalidate(i);
                continue;
            }
            if self.observers[i].table == table && self.observers[i].row > row {
                self.observers[i].row -= 1;
            }
            i += 1;
        }
        Ok(())
    }

    fn move_last_over(&mut self, row: usize, last_row: usize) -> Result<(), StoreError> {
        let table = self.current_table;
        let mut i = 0;
        while i < self.observers.len() {
            if self.observers[i].table == table && self.observers[i].row == row {
                self.invalidate(i);
                continue;
            }
            if self.observers[i].table == table && self.observers[i].row == last_row {
                self.observers[i].row = row;
            }
            i += 1;
        }
        Ok(())
    }

    fn clear_table(&mut self, _prev_size: usize) -> Result<(), StoreError> {
        let table = self.current_table;
        let mut i = 0;
        while i < self.observers.len() {
            if self.observers[i].table == table {
                self.invalidate(i);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn set_value(&mut self, col: usize, row: usize) -> Result<(), StoreError> {
        self.mark_dirty(row, col);
        Ok(())
    }

    fn select_link_list(&mut self, col: usize, row: usize) -> Result<(), StoreError> {
        let table = self.current_table;
        self.active_list = self
            .observers
            .iter()
            .find(|o| o.table == table && o.row == row)
            .map(|o| (o.key, col));
        Ok(())
    }

    fn list_set(&mut self, index: usize) -> Result<(), StoreError> {
        self.append_list_change(DeltaKind::Set, index);
        Ok(())
    }

    fn list_insert(&mut self, index: usize) -> Result<(), StoreError> {
        self.append_list_change(DeltaKind::Insert, index);
        Ok(())
    }

    fn list_erase(&mut self, index: usize) -> Result<(), StoreError> {
        self.append_list_change(DeltaKind::Remove, index);
        Ok(())
    }

    fn list_swap(&mut self, a: usize, b: usize) -> Result<(), StoreError> {
        self.append_list_change(DeltaKind::Set, a);
        self.append_list_change(DeltaKind::Set, b);
        Ok(())
    }

    fn list_move(&mut self, from: usize, to: usize) -> Result<(), StoreError> {
        let (from, to) = if from > to { (to, from) } else { (from, to) };
        let Some(column) = self.active_column() else {
            return Ok(());
        };
        if column.kind == DeltaKind::SetAll {
            return Ok(());
        }
        if column.kind == DeltaKind::None {
            column.kind = DeltaKind::Set;
            column.changed = true;
        }
        if column.kind == DeltaKind::Set {
            for index in from..=to {
                column.indices.add(index);
            }
        } else {
            column.indices.set(0);
            column.kind = DeltaKind::SetAll;
        }
        Ok(())
    }

    fn list_clear(&mut self, prev_size: usize) -> Result<(), StoreError> {
        let Some(column) = self.active_column() else {
            return Ok(());
        };
        if column.kind == DeltaKind::SetAll {
            return Ok(());
        }
        let mut size = prev_size;
        match column.kind {
            DeltaKind::Remove => size += column.indices.len(),
            DeltaKind::Insert => size -= column.indices.len(),
            _ => {}
        }
        column.indices.set(size);
        column.kind = DeltaKind::Remove;
        column.changed = true;
        Ok(())
    }

    fn schema_changed(&mut self) -> Result<(), StoreError> {
        // Deltas may be incomplete across a migration; the caller treats it
        // as a full reload anyway
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_store::LogOp;
    use pretty_assertions::assert_eq;

    fn observe(observed: Vec<ObservedRow>, ops: &[LogOp]) -> (Vec<RowChangeInfo>, Vec<u64>) {
        let mut observer = BindingObserver::new(observed);
        for op in ops {
            op.dispatch(&mut observer).unwrap();
        }
        observer.finish()
    }

    fn row(key: u64, table: usize, row: usize) -> ObservedRow {
        ObservedRow { key, table, row }
    }

    #[test]
    fn value_sets_mark_columns_dirty() {
        let (changed, invalidated) = observe(
            vec![row(1, 0, 0), row(2, 0, 1)],
            &[
                LogOp::SelectTable { table: 0 },
                LogOp::SetValue { col: 2, row: 1, value: lodestone_store::Value::Null },
            ],
        );
        assert!(invalidated.is_empty());
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].key, 2);
        assert_eq!(changed[0].columns.len(), 1);
        assert_eq!(changed[0].columns[0].col, 2);
        assert_eq!(changed[0].columns[0].kind, DeltaKind::None);
    }

    #[test]
    fn erases_invalidate_and_shift_observers() {
        let (changed, invalidated) = observe(
            vec![row(1, 0, 0), row(2, 0, 2)],
            &[
                LogOp::SelectTable { table: 0 },
                LogOp::EraseRow { row: 0 },
                LogOp::SetValue { col: 0, row: 1, value: lodestone_store::Value::Null },
            ],
        );
        assert_eq!(invalidated, [1]);
        // The observer of row 2 shifted down to row 1 and caught the set
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].key, 2);
        assert_eq!(changed[0].row, 1);
    }

    #[test]
    fn move_last_over_retargets_the_last_observer() {
        let (_, invalidated) = observe(
            vec![row(1, 0, 0), row(2, 0, 3)],
            &[
                LogOp::SelectTable { table: 0 },
                LogOp::MoveLastOver { row: 0, last_row: 3 },
            ],
        );
        assert_eq!(invalidated, [1]);
    }

    #[test]
    fn uniform_list_ops_accumulate_indices() {
        let (changed, _) = observe(
            vec![row(7, 0, 0)],
            &[
                LogOp::SelectTable { table: 0 },
                LogOp::SelectLinkList { col: 1, row: 0 },
                LogOp::ListInsert { index: 0, target: 0 },
                LogOp::ListInsert { index: 1, target: 0 },
            ],
        );
        assert_eq!(changed[0].columns[0].kind, DeltaKind::Insert);
        assert_eq!(changed[0].columns[0].indices.iter().collect::<Vec<_>>(), [0, 1]);
    }

    #[test]
    fn mixed_list_ops_collapse_to_set_all() {
        let (changed, _) = observe(
            vec![row(7, 0, 0)],
            &[
                LogOp::SelectTable { table: 0 },
                LogOp::SelectLinkList { col: 1, row: 0 },
                LogOp::ListInsert { index: 0, target: 0 },
                LogOp::ListErase { index: 0 },
            ],
        );
        assert_eq!(changed[0].columns[0].kind, DeltaKind::SetAll);
    }

    #[test]
    fn list_clear_reports_the_adjusted_size() {
        let (changed, _) = observe(
            vec![row(7, 0, 0)],
            &[
                LogOp::SelectTable { table: 0 },
                LogOp::SelectLinkList { col: 1, row: 0 },
                LogOp::ListErase { index: 2 },
                LogOp::ListClear { prev_size: 4 },
            ],
        );
        let delta = &changed[0].columns[0];
        assert_eq!(delta.kind, DeltaKind::Remove);
        // 4 remaining at clear time plus the one already removed
        assert_eq!(delta.indices.iter().collect::<Vec<_>>(), [0, 1, 2, 3, 4]);
    }
}
