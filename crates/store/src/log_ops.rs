use crate::{StoreError, Value};

/// One entry of the transaction log.
///
/// Row and list operations apply to the most recently selected table or
/// link list; a commit's op list always begins with the relevant select.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogOp {
    SelectTable { table: usize },
    /// `count` rows appended starting at index `row` (== the prior row count).
    InsertRows { row: usize, count: usize },
    /// Ordered erase: rows above shift down.
    EraseRow { row: usize },
    /// The last row (`last_row`) overwrote `row` and the table shrank by one.
    MoveLastOver { row: usize, last_row: usize },
    ClearTable { prev_size: usize },
    SetValue { col: usize, row: usize, value: Value },
    SetLink { col: usize, row: usize, target: Option<usize> },
    SelectLinkList { col: usize, row: usize },
    ListSet { index: usize, target: usize },
    ListInsert { index: usize, target: usize },
    ListErase { index: usize },
    ListNullify { index: usize },
    ListSwap { a: usize, b: usize },
    ListMove { from: usize, to: usize },
    ListClear { prev_size: usize },
    /// Stand-in for any schema-mutating instruction. Observers reject it.
    SchemaChanged,
}

/// Callbacks invoked while a transaction log is replayed by
/// [`StoreHandle::advance`](crate::StoreHandle::advance).
///
/// Returning [`StoreError::UnsupportedLogOp`] aborts observation (but not
/// the replay itself: the handle still lands on the target version).
pub trait ReplayObserver {
    fn select_table(&mut self, table: usize) -> Result<(), StoreError> {
        let _ = table;
        Ok(())
    }

    fn insert_rows(&mut self, row: usize, count: usize) -> Result<(), StoreError> {
        let _ = (row, count);
        Ok(())
    }

    fn erase_row(&mut self, row: usize) -> Result<(), StoreError> {
        let _ = row;
        Ok(())
    }

    fn move_last_over(&mut self, row: usize, last_row: usize) -> Result<(), StoreError> {
        let _ = (row, last_row);
        Ok(())
    }

    fn clear_table(&mut self, prev_size: usize) -> Result<(), StoreError> {
        let _ = prev_size;
        Ok(())
    }

    fn set_value(&mut self, col: usize, row: usize) -> Result<(), StoreError> {
        let _ = (col, row);
        Ok(())
    }

    fn set_link(&mut self, col: usize, row: usize) -> Result<(), StoreError> {
        self.set_value(col, row)
    }

    fn select_link_list(&mut self, col: usize, row: usize) -> Result<(), StoreError> {
        let _ = (col, row);
        Ok(())
    }

    fn list_set(&mut self, index: usize) -> Result<(), StoreError> {
        let _ = index;
        Ok(())
    }

    fn list_insert(&mut self, index: usize) -> Result<(), StoreError> {
        let _ = index;
        Ok(())
    }

    fn list_erase(&mut self, index: usize) -> Result<(), StoreError> {
        let _ = index;
        Ok(())
    }

    fn list_swap(&mut self, a: usize, b: usize) -> Result<(), StoreError> {
        let _ = (a, b);
        Ok(())
    }

    fn list_move(&mut self, from: usize, to: usize) -> Result<(), StoreError> {
        let _ = (from, to);
        Ok(())
    }

    fn list_clear(&mut self, prev_size: usize) -> Result<(), StoreError> {
        let _ = prev_size;
        Ok(())
    }

    fn schema_changed(&mut self) -> Result<(), StoreError> {
        Err(StoreError::UnsupportedLogOp)
    }

    /// Called once after the last log entry of an advance.
    fn parse_complete(&mut self) {}
}

/// An observer which ignores everything, including schema changes.
pub struct NullObserver;

impl ReplayObserver for NullObserver {
    fn schema_changed(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl LogOp {
    /// Route this op to the matching observer callback.
    pub fn dispatch(&self, observer: &mut dyn ReplayObserver) -> Result<(), StoreError> {
        match *self {
            LogOp::SelectTable { table } => observer.select_table(table),
            LogOp::InsertRows { row, count } => observer.insert_rows(row, count),
            LogOp::EraseRow { row } => observer.erase_row(row),
            LogOp::MoveLastOver { row, last_row } => observer.move_last_over(row, last_row),
            LogOp::ClearTable { prev_size } => observer.clear_table(prev_size),
            LogOp::SetValue { col, row, .. } => observer.set_value(col, row),
            LogOp::SetLink { col, row, .. } => observer.set_link(col, row),
            LogOp::SelectLinkList { col, row } => observer.select_link_list(col, row),
            LogOp::ListSet { index, .. } => observer.list_set(index),
            LogOp::ListInsert { index, .. } => observer.list_insert(index),
            LogOp::ListErase { index } => observer.list_erase(index),
            LogOp::ListNullify { index } => observer.list_erase(index),
            LogOp::ListSwap { a, b } => observer.list_swap(a, b),
            LogOp::ListMove { from, to } => observer.list_move(from, to),
            LogOp::ListClear { prev_size } => observer.list_clear(prev_size),
            LogOp::SchemaChanged => observer.schema_changed(),
        }
    }
}
