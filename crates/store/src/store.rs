use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{ColumnKind, Handover, LogOp, ReplayObserver, StoreError, Table, TableSpec, Value};

/// An opaque, totally-ordered snapshot version. A new version is minted by
/// every commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u64);

struct SharedInner {
    // log[i] holds the ops taking version i to version i + 1; the latest
    // committed version is therefore log.len()
    log: Vec<Vec<LogOp>>,
    writer_active: bool,
}

/// The shared, versioned state of one database. Handles materialize private
/// views of it at a pinned version and advance by replaying the log.
pub struct SharedStore {
    schema: Vec<TableSpec>,
    inner: Mutex<SharedInner>,
    writer_cv: Condvar,
}

impl SharedStore {
    pub fn new(schema: Vec<TableSpec>) -> Arc<SharedStore> {
        Arc::new(SharedStore {
            schema,
            inner: Mutex::new(SharedInner {
                log: Vec::new(),
                writer_active: false,
            }),
            writer_cv: Condvar::new(),
        })
    }

    pub fn schema(&self) -> &[TableSpec] {
        &self.schema
    }

    pub fn table_index(&self, name: &str) -> Option<usize> {
        self.schema.iter().position(|t| t.name == name)
    }

    pub fn latest_version(&self) -> Version {
        Version(self.inner.lock().log.len() as u64)
    }

    /// Open a handle pinned at the latest committed version.
    pub fn handle(self: &Arc<Self>) -> StoreHandle {
        let (ops, version) = {
            let inner = self.inner.lock();
            (inner.log.clone(), Version(inner.log.len() as u64))
        };
        StoreHandle {
            store: Arc::clone(self),
            tables: self.materialize(&ops),
            version,
            write: None,
        }
    }

    /// Open a handle pinned at `version`.
    pub fn handle_at(self: &Arc<Self>, version: Version) -> Result<StoreHandle, StoreError> {
        let ops = {
            let inner = self.inner.lock();
            if version.0 as usize > inner.log.len() {
                return Err(StoreError::UnknownVersion(version));
            }
            inner.log[..version.0 as usize].to_vec()
        };
        Ok(StoreHandle {
            store: Arc::clone(self),
            tables: self.materialize(&ops),
            version,
            write: None,
        })
    }

    fn materialize(&self, ops: &[Vec<LogOp>]) -> Vec<Table> {
        let mut tables = self.empty_tables();
        let mut ctx = ReplayCtx::default();
        for commit in ops {
            for op in commit {
                apply_op(&mut tables, &mut ctx, op);
            }
        }
        tables
    }

    fn empty_tables(&self) -> Vec<Table> {
        self.schema
            .iter()
            .enumerate()
            .map(|(i, spec)| Table::new(i, spec.clone()))
            .collect()
    }

    fn release_writer(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.writer_active);
        inner.writer_active = false;
        drop(inner);
        self.writer_cv.notify_one();
    }
}

#[derive(Default)]
struct ReplayCtx {
    table: usize,
    list: Option<(usize, usize, usize)>, // (table, row, col)
}

fn apply_op(tables: &mut [Table], ctx: &mut ReplayCtx, op: &LogOp) {
    let fail = "replaying a committed log op failed";
    match *op {
        LogOp::SelectTable { table } => {
            ctx.table = table;
            ctx.list = None;
        }
        LogOp::InsertRows { row, count } => {
            debug_assert_eq!(row, tables[ctx.table].row_count());
            tables[ctx.table].insert_rows(count);
        }
        LogOp::EraseRow { row } => tables[ctx.table].erase_row(row).expect(fail),
        LogOp::MoveLastOver { row, last_row } => {
            debug_assert_eq!(last_row + 1, tables[ctx.table].row_count());
            tables[ctx.table].move_last_over(row).expect(fail);
        }
        LogOp::ClearTable { .. } => tables[ctx.table].clear(),
        LogOp::SetValue { col, row, ref value } => {
            tables[ctx.table].set_value(row, col, value.clone()).expect(fail);
        }
        LogOp::SetLink { col, row, target } => {
            tables[ctx.table].set_link(row, col, target).expect(fail);
        }
        LogOp::SelectLinkList { col, row } => ctx.list = Some((ctx.table, row, col)),
        LogOp::ListSet { index, target } => with_list(tables, ctx, |list| list[index] = target),
        LogOp::ListInsert { index, target } => with_list(tables, ctx, |list| list.insert(index, target)),
        LogOp::ListErase { index } | LogOp::ListNullify { index } => {
            with_list(tables, ctx, |list| {
                list.remove(index);
            });
        }
        LogOp::ListSwap { a, b } => with_list(tables, ctx, |list| list.swap(a, b)),
        LogOp::ListMove { from, to } => {
            with_list(tables, ctx, |list| {
                let target = list.remove(from);
                list.insert(to, target);
            });
        }
        LogOp::ListClear { .. } => with_list(tables, ctx, |list| list.clear()),
        LogOp::SchemaChanged => {}
    }
}

fn with_list(tables: &mut [Table], ctx: &ReplayCtx, f: impl FnOnce(&mut Vec<usize>)) {
    let (table, row, col) = ctx.list.expect("list op without a selected link list");
    f(tables[table]
        .list_mut(row, col)
        .expect("replaying a committed log op failed"));
}

struct WriteState {
    ops: Vec<LogOp>,
    // Table state as of the start of the transaction, for rollback
    undo: Vec<Table>,
    selected_table: Option<usize>,
    selected_list: Option<(usize, usize)>, // (row, col) within selected_table
}

/// A materialized private view of a [`SharedStore`] pinned at a version.
///
/// A handle never observes commits implicitly: it sees new state only via
/// [`advance`](Self::advance) (which replays the log through an observer)
/// or by beginning a write transaction (which first catches up to the
/// latest version).
pub struct StoreHandle {
    store: Arc<SharedStore>,
    tables: Vec<Table>,
    version: Version,
    write: Option<WriteState>,
}

impl StoreHandle {
    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn latest_version(&self) -> Version {
        self.store.latest_version()
    }

    pub fn in_write(&self) -> bool {
        self.write.is_some()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn table(&self, index: usize) -> Result<&Table, StoreError> {
        self.tables.get(index).ok_or(StoreError::NoSuchTable(index))
    }

    /// Replay the log from this handle's version to `target`, applying each
    /// op to the private view and reporting it to `observer`.
    ///
    /// If the observer rejects an op, the remaining callbacks (including
    /// `parse_complete`) are skipped but the view still lands on `target`;
    /// the caller is expected to recompute whatever it was deriving.
    pub fn advance(&mut self, target: Version, observer: &mut dyn ReplayObserver) -> Result<(), StoreError> {
        if self.write.is_some() {
            return Err(StoreError::WriteInProgress);
        }
        if target < self.version {
            return Err(StoreError::VersionMismatch {
                expected: self.version,
                actual: target,
            });
        }
        let commits = {
            let inner = self.store.inner.lock();
            if target.0 as usize > inner.log.len() {
                return Err(StoreError::UnknownVersion(target));
            }
            inner.log[self.version.0 as usize..target.0 as usize].to_vec()
        };

        let mut ctx = ReplayCtx::default();
        let mut unsupported = false;
        for commit in &commits {
            for op in commit {
                apply_op(&mut self.tables, &mut ctx, op);
                if !unsupported && op.dispatch(observer).is_err() {
                    unsupported = true;
                }
            }
        }
        self.version = target;
        if unsupported {
            return Err(StoreError::UnsupportedLogOp);
        }
        observer.parse_complete();
        Ok(())
    }

    /// Advance to the latest committed version; returns the version the
    /// handle landed on.
    pub fn advance_to_latest(&mut self, observer: &mut dyn ReplayObserver) -> Result<Version, StoreError> {
        let target = self.store.latest_version();
        self.advance(target, observer)?;
        Ok(self.version)
    }

    /// Export `payload` inside an envelope stamped with this handle's
    /// version.
    pub fn export<T>(&self, payload: T) -> Handover<T> {
        Handover::new(payload, self.version)
    }

    /// Unpack a handover envelope. Fails unless this handle is at exactly
    /// the version the payload was exported at.
    pub fn import<T>(&self, handover: Handover<T>) -> Result<T, StoreError> {
        if handover.version() != self.version {
            return Err(StoreError::VersionMismatch {
                expected: handover.version(),
                actual: self.version,
            });
        }
        Ok(handover.into_payload())
    }

    // ------------------------------------------------------------------
    // Write transactions

    /// Begin a write transaction: wait for the single writer slot, catch up
    /// to the latest version (reporting the replay to `observer`), and
    /// start recording ops.
    pub fn begin_write(&mut self, observer: &mut dyn ReplayObserver) -> Result<(), StoreError> {
        if self.write.is_some() {
            return Err(StoreError::WriteInProgress);
        }
        {
            let mut inner = self.store.inner.lock();
            while inner.writer_active {
                self.store.writer_cv.wait(&mut inner);
            }
            inner.writer_active = true;
        }
        // Nothing can commit while we hold the writer slot, so the latest
        // version is stable here
        let target = self.store.latest_version();
        if let Err(err) = self.advance(target, observer) {
            self.store.release_writer();
            return Err(err);
        }
        self.write = Some(WriteState {
            ops: Vec::new(),
            undo: self.tables.clone(),
            selected_table: None,
            selected_list: None,
        });
        Ok(())
    }

    /// Commit the recorded ops, minting the next version. The handle stays
    /// pinned at the new version.
    pub fn commit(&mut self) -> Result<Version, StoreError> {
        let write = self.write.take().ok_or(StoreError::NotInWrite)?;
        let version = {
            let mut inner = self.store.inner.lock();
            debug_assert!(inner.writer_active);
            inner.log.push(write.ops);
            inner.writer_active = false;
            Version(inner.log.len() as u64)
        };
        self.store.writer_cv.notify_one();
        self.version = version;
        log::trace!("committed version {}", version.0);
        Ok(version)
    }

    /// Abandon the write transaction, restoring the view to the state at
    /// the start of the transaction.
    pub fn rollback(&mut self) -> Result<(), StoreError> {
        let write = self.write.take().ok_or(StoreError::NotInWrite)?;
        self.tables = write.undo;
        self.store.release_writer();
        Ok(())
    }

    /// Append one empty row; returns its index.
    pub fn insert_row(&mut self, table: usize) -> Result<usize, StoreError> {
        let row = self.table(table)?.row_count();
        self.select_table(table)?;
        self.tables[table].insert_rows(1);
        self.record(LogOp::InsertRows { row, count: 1 });
        Ok(row)
    }

    /// Ordered erase: rows above `row` shift down by one.
    pub fn erase_row(&mut self, table: usize, row: usize) -> Result<(), StoreError> {
        self.select_table(table)?;
        self.tables[table].erase_row(row)?;
        self.record(LogOp::EraseRow { row });
        Ok(())
    }

    /// Unordered erase: the last row overwrites `row`.
    pub fn move_last_over(&mut self, table: usize, row: usize) -> Result<(), StoreError> {
        let last_row = self
            .table(table)?
            .row_count()
            .checked_sub(1)
            .ok_or(StoreError::NoSuchRow { table, row })?;
        self.select_table(table)?;
        self.tables[table].move_last_over(row)?;
        self.record(LogOp::MoveLastOver { row, last_row });
        Ok(())
    }

    pub fn clear_table(&mut self, table: usize) -> Result<(), StoreError> {
        let prev_size = self.table(table)?.row_count();
        self.select_table(table)?;
        self.tables[table].clear();
        self.record(LogOp::ClearTable { prev_size });
        Ok(())
    }

    pub fn set_value(&mut self, table: usize, row: usize, col: usize, value: Value) -> Result<(), StoreError> {
        self.select_table(table)?;
        self.tables[table].set_value(row, col, value.clone())?;
        self.record(LogOp::SetValue { col, row, value });
        Ok(())
    }

    pub fn set_link(
        &mut self,
        table: usize,
        row: usize,
        col: usize,
        target: Option<usize>,
    ) -> Result<(), StoreError> {
        self.check_link_target(table, col, target)?;
        self.select_table(table)?;
        self.tables[table].set_link(row, col, target)?;
        self.record(LogOp::SetLink { col, row, target });
        Ok(())
    }

    pub fn list_insert(
        &mut self,
        table: usize,
        row: usize,
        col: usize,
        index: usize,
        target: usize,
    ) -> Result<(), StoreError> {
        self.check_link_target(table, col, Some(target))?;
        self.select_list(table, row, col)?;
        let list = self.tables[table].list_mut(row, col)?;
        if index > list.len() {
            return Err(StoreError::NoSuchRow { table, row: index });
        }
        list.insert(index, target);
        self.record(LogOp::ListInsert { index, target });
        Ok(())
    }

    pub fn list_set(
        &mut self,
        table: usize,
        row: usize,
        col: usize,
        index: usize,
        target: usize,
    ) -> Result<(), StoreError> {
        self.check_link_target(table, col, Some(target))?;
        self.select_list(table, row, col)?;
        let list = self.tables[table].list_mut(row, col)?;
        *list.get_mut(index).ok_or(StoreError::NoSuchRow { table, row: index })? = target;
        self.record(LogOp::ListSet { index, target });
        Ok(())
    }

    pub fn list_erase(&mut self, table: usize, row: usize, col: usize, index: usize) -> Result<(), StoreError> {
        self.select_list(table, row, col)?;
        let list = self.tables[table].list_mut(row, col)?;
        if index >= list.len() {
            return Err(StoreError::NoSuchRow { table, row: index });
        }
        list.remove(index);
        self.record(LogOp::ListErase { index });
        Ok(())
    }

    pub fn list_move(
        &mut self,
        table: usize,
        row: usize,
        col: usize,
        from: usize,
        to: usize,
    ) -> Result<(), StoreError> {
        self.select_list(table, row, col)?;
        let list = self.tables[table].list_mut(row, col)?;
        if from >= list.len() || to >= list.len() {
            return Err(StoreError::NoSuchRow { table, row: from.max(to) });
        }
        let target = list.remove(from);
        list.insert(to, target);
        self.record(LogOp::ListMove { from, to });
        Ok(())
    }

    pub fn list_swap(
        &mut self,
        table: usize,
        row: usize,
        col: usize,
        a: usize,
        b: usize,
    ) -> Result<(), StoreError> {
        self.select_list(table, row, col)?;
        let list = self.tables[table].list_mut(row, col)?;
        if a >= list.len() || b >= list.len() {
            return Err(StoreError::NoSuchRow { table, row: a.max(b) });
        }
        list.swap(a, b);
        self.record(LogOp::ListSwap { a, b });
        Ok(())
    }

    pub fn list_clear(&mut self, table: usize, row: usize, col: usize) -> Result<(), StoreError> {
        self.select_list(table, row, col)?;
        let list = self.tables[table].list_mut(row, col)?;
        let prev_size = list.len();
        list.clear();
        self.record(LogOp::ListClear { prev_size });
        Ok(())
    }

    // ------------------------------------------------------------------

    fn select_table(&mut self, table: usize) -> Result<(), StoreError> {
        self.table(table)?;
        let write = self.write.as_mut().ok_or(StoreError::NotInWrite)?;
        if write.selected_table != Some(table) {
            write.selected_table = Some(table);
            write.selected_list = None;
            write.ops.push(LogOp::SelectTable { table });
        }
        Ok(())
    }

    fn select_list(&mut self, table: usize, row: usize, col: usize) -> Result<(), StoreError> {
        self.select_table(table)?;
        let write = self.write.as_mut().expect("select_table verified the write");
        if write.selected_list != Some((row, col)) {
            write.selected_list = Some((row, col));
            write.ops.push(LogOp::SelectLinkList { col, row });
        }
        Ok(())
    }

    fn record(&mut self, op: LogOp) {
        self.write
            .as_mut()
            .expect("mutations are guarded by select_table")
            .ops
            .push(op);
    }

    fn check_link_target(&self, table: usize, col: usize, target: Option<usize>) -> Result<(), StoreError> {
        let Some(target_row) = target else { return Ok(()) };
        let target_table = match self.table(table)?.column_kind(col)? {
            ColumnKind::Link { target } | ColumnKind::LinkList { target } => target,
            ColumnKind::Value => return Err(StoreError::ColumnKindMismatch { table, col }),
        };
        if target_row < self.table(target_table)?.row_count() {
            Ok(())
        } else {
            Err(StoreError::NoSuchRow {
                table: target_table,
                row: target_row,
            })
        }
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        if self.write.take().is_some() {
            self.store.release_writer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ColumnSpec, NullObserver, TableSpec};
    use pretty_assertions::assert_eq;

    fn store() -> Arc<SharedStore> {
        SharedStore::new(vec![TableSpec::new(
            "item",
            vec![ColumnSpec::value("name"), ColumnSpec::link_list("children", 0)],
        )])
    }

    #[derive(Default)]
    struct Recording(Vec<String>);

    impl ReplayObserver for Recording {
        fn select_table(&mut self, table: usize) -> Result<(), StoreError> {
            self.0.push(format!("select {table}"));
            Ok(())
        }

        fn insert_rows(&mut self, row: usize, count: usize) -> Result<(), StoreError> {
            self.0.push(format!("insert {row}+{count}"));
            Ok(())
        }

        fn move_last_over(&mut self, row: usize, last_row: usize) -> Result<(), StoreError> {
            self.0.push(format!("move_over {row}<-{last_row}"));
            Ok(())
        }

        fn parse_complete(&mut self) {
            self.0.push("complete".into());
        }
    }

    #[test]
    fn commits_mint_versions_and_replay() {
        let store = store();
        let mut writer = store.handle();
        assert_eq!(writer.version(), Version(0));

        writer.begin_write(&mut NullObserver).unwrap();
        let row = writer.insert_row(0).unwrap();
        writer.set_value(0, row, 0, Value::Int(7)).unwrap();
        assert_eq!(writer.commit().unwrap(), Version(1));

        // A reader opened before the commit sees nothing until it advances
        let mut reader = store.handle_at(Version(0)).unwrap();
        assert_eq!(reader.table(0).unwrap().row_count(), 0);

        let mut rec = Recording::default();
        reader.advance(Version(1), &mut rec).unwrap();
        assert_eq!(reader.table(0).unwrap().row_count(), 1);
        assert_eq!(reader.table(0).unwrap().value(0, 0).unwrap(), &Value::Int(7));
        assert_eq!(rec.0, ["select 0", "insert 0+1", "complete"]);
    }

    #[test]
    fn move_last_over_reorders_rows() {
        let store = store();
        let mut writer = store.handle();
        writer.begin_write(&mut NullObserver).unwrap();
        for i in 0..4 {
            let row = writer.insert_row(0).unwrap();
            writer.set_value(0, row, 0, Value::Int(i)).unwrap();
        }
        writer.move_last_over(0, 0).unwrap();
        writer.commit().unwrap();

        let table = writer.table(0).unwrap();
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.value(0, 0).unwrap(), &Value::Int(3));
        assert_eq!(table.value(1, 0).unwrap(), &Value::Int(1));
    }

    #[test]
    fn rollback_restores_the_view() {
        let store = store();
        let mut writer = store.handle();
        writer.begin_write(&mut NullObserver).unwrap();
        writer.insert_row(0).unwrap();
        writer.rollback().unwrap();
        assert_eq!(writer.table(0).unwrap().row_count(), 0);
        assert_eq!(store.latest_version(), Version(0));

        // The writer slot was released
        writer.begin_write(&mut NullObserver).unwrap();
        writer.commit().unwrap();
    }

    #[test]
    fn import_requires_matching_version() {
        let store = store();
        let mut writer = store.handle();
        let envelope = writer.export("payload");

        writer.begin_write(&mut NullObserver).unwrap();
        writer.insert_row(0).unwrap();
        writer.commit().unwrap();

        assert_eq!(
            writer.import(envelope).unwrap_err(),
            StoreError::VersionMismatch {
                expected: Version(0),
                actual: Version(1),
            }
        );

        let reader = store.handle_at(Version(0)).unwrap();
        let envelope = writer.export("payload");
        assert_eq!(
            reader.import(envelope).unwrap_err(),
            StoreError::VersionMismatch {
                expected: Version(1),
                actual: Version(0),
            }
        );
    }

    #[test]
    fn schema_change_interrupts_observation_but_advances() {
        let store = store();
        {
            let mut inner = store.inner.lock();
            inner.log.push(vec![
                LogOp::SelectTable { table: 0 },
                LogOp::InsertRows { row: 0, count: 1 },
                LogOp::SchemaChanged,
            ]);
        }
        let mut reader = store.handle_at(Version(0)).unwrap();
        let mut rec = Recording::default();
        assert_eq!(
            reader.advance(Version(1), &mut rec).unwrap_err(),
            StoreError::UnsupportedLogOp
        );
        // State advanced anyway; observation was cut short of parse_complete
        assert_eq!(reader.version(), Version(1));
        assert_eq!(reader.table(0).unwrap().row_count(), 1);
        assert_eq!(rec.0, ["select 0", "insert 0+1"]);
    }
}
