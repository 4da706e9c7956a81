use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use lodestone_changeset::ChangeBuilder;
use lodestone_store::{ReplayObserver, StoreError};
use parking_lot::Mutex;

/// A live reference to one link list, shared between its notifier and the
/// transaction-log parser. The parser keeps `row` up to date as origin rows
/// shift and clears `alive` when the origin row is deleted.
pub(crate) struct ListRef {
    pub(crate) table: usize,
    pub(crate) col: usize,
    row: AtomicUsize,
    alive: AtomicBool,
}

impl ListRef {
    pub(crate) fn new(table: usize, row: usize, col: usize) -> Arc<ListRef> {
        Arc::new(ListRef {
            table,
            col,
            row: AtomicUsize::new(row),
            alive: AtomicBool::new(true),
        })
    }

    pub(crate) fn row(&self) -> usize {
        self.row.load(Ordering::Acquire)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn set_row(&self, row: usize) {
        self.row.store(row, Ordering::Release);
    }

    fn kill(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// A list notifier's request for direct parsing: ops on the referenced list
/// are fed straight into the shared builder.
pub(crate) struct ListChangeInfo {
    pub(crate) list: Arc<ListRef>,
    pub(crate) changes: Arc<Mutex<ChangeBuilder>>,
}

/// Everything the notifiers collectively need from one transaction-log
/// advance: a change builder per interesting table, plus direct edits for
/// registered link lists.
#[derive(Default)]
pub(crate) struct TransactionChangeInfo {
    tables_needed: Vec<bool>,
    table_moves_needed: Vec<bool>,
    lists: Vec<ListChangeInfo>,
    tables: Vec<ChangeBuilder>,
}

impl TransactionChangeInfo {
    pub(crate) fn mark_table_needed(&mut self, table: usize) {
        if self.tables_needed.len() <= table {
            self.tables_needed.resize(table + 1, false);
        }
        self.tables_needed[table] = true;
    }

    pub(crate) fn mark_table_moves_needed(&mut self, table: usize) {
        if self.table_moves_needed.len() <= table {
            self.table_moves_needed.resize(table + 1, false);
        }
        self.table_moves_needed[table] = true;
    }

    pub(crate) fn add_list(&mut self, info: ListChangeInfo) {
        self.lists.push(info);
    }

    fn needs_table(&self, table: usize) -> bool {
        self.tables_needed.get(table).copied().unwrap_or(false)
    }

    fn moves_needed(&self, table: usize) -> bool {
        self.table_moves_needed.get(table).copied().unwrap_or(false)
    }

    /// The parsed changes for `table`, if any notifier asked for it and the
    /// log touched it.
    pub(crate) fn table_changes(&self, table: usize) -> Option<&ChangeBuilder> {
        self.tables.get(table)
    }

    pub(crate) fn row_modified(&self, table: usize, row: usize) -> bool {
        self.table_changes(table)
            .is_some_and(|c| c.modifications.contains(row))
    }

    pub(crate) fn table_modified(&self, table: usize) -> bool {
        self.table_changes(table)
            .is_some_and(|c| !c.modifications.is_empty())
    }

    /// Discard everything parsed so far (used when the log contained an
    /// unsupported instruction and the notifiers fall back to a full
    /// recomputation).
    pub(crate) fn reset_parsed(&mut self) {
        self.tables.clear();
        for list in &self.lists {
            *list.changes.lock() = ChangeBuilder::new();
        }
    }

    fn builder_mut(&mut self, table: usize) -> Option<&mut ChangeBuilder> {
        if !self.needs_table(table) {
            return None;
        }
        if self.tables.len() <= table {
            self.tables.resize_with(table + 1, ChangeBuilder::new);
        }
        Some(&mut self.tables[table])
    }
}

/// Translates the transaction log into a [`TransactionChangeInfo`]: table
/// ops feed the per-table builders, link-list ops feed the registered list
/// builders directly, and origin-row bookkeeping for registered lists is
/// kept up to date as rows shift underneath them.
pub(crate) struct ChangeInfoParser<'a> {
    info: &'a mut TransactionChangeInfo,
    current_table: usize,
    active_list: Option<usize>,
}

impl<'a> ChangeInfoParser<'a> {
    pub(crate) fn new(info: &'a mut TransactionChangeInfo) -> Self {
        Self {
            info,
            current_table: 0,
            active_list: None,
        }
    }

    fn with_builder(&mut self, f: impl FnOnce(&mut ChangeBuilder, bool)) {
        let moves = self.info.moves_needed(self.current_table);
        if let Some(builder) = self.info.builder_mut(self.current_table) {
            f(builder, moves);
        }
    }

    fn with_list(&mut self, f: impl FnOnce(&mut ChangeBuilder)) {
        if let Some(index) = self.active_list {
            let list = &self.info.lists[index];
            if list.list.is_alive() {
                let mut changes = list.changes.lock();
                f(&mut changes);
            }
        }
    }

    /// Origin-row bookkeeping for an ordered erase in the current table.
    fn lists_erase_row(&mut self, row: usize) {
        for (i, entry) in self.info.lists.iter().enumerate() {
            let list = &entry.list;
            if list.table != self.current_table || !list.is_alive() {
                continue;
            }
            let list_row = list.row();
            if list_row == row {
                list.kill();
                if self.active_list == Some(i) {
                    self.active_list = None;
                }
            } else if list_row > row {
                list.set_row(list_row - 1);
            }
        }
    }

    fn lists_move_last_over(&mut self, row: usize, last_row: usize) {
        for (i, entry) in self.info.lists.iter().enumerate() {
            let list = &entry.list;
            if list.table != self.current_table || !list.is_alive() {
                continue;
            }
            let list_row = list.row();
            if list_row == row {
                list.kill();
                if self.active_list == Some(i) {
                    self.active_list = None;
                }
            } else if list_row == last_row {
                list.set_row(row);
            }
        }
    }

    fn lists_clear_table(&mut self) {
        for (i, entry) in self.info.lists.iter().enumerate() {
            let list = &entry.list;
            if list.table == self.current_table && list.is_alive() {
                list.kill();
                if self.active_list == Some(i) {
                    self.active_list = None;
                }
            }
        }
    }
}

impl ReplayObserver for ChangeInfoParser<'_> {
    fn select_table(&mut self, table: usize) -> Result<(), StoreError> {
        self.current_table = table;
        self.active_list = None;
        Ok(())
    }

    fn insert_rows(&mut self, row: usize, count: usize) -> Result<(), StoreError> {
        self.with_builder(|b, moves| b.insert(row, count, moves));
        Ok(())
    }

    fn erase_row(&mut self, row: usize) -> Result<(), StoreError> {
        self.with_builder(|b, _| b.erase(row));
        self.lists_erase_row(row);
        Ok(())
    }

    fn move_last_over(&mut self, row: usize, last_row: usize) -> Result<(), StoreError> {
        self.with_builder(|b, moves| b.move_over(row, last_row, moves));
        self.lists_move_last_over(row, last_row);
        Ok(())
    }

    fn clear_table(&mut self, prev_size: usize) -> Result<(), StoreError> {
        self.with_builder(|b, _| b.clear(prev_size));
        self.lists_clear_table();
        Ok(())
    }

    fn set_value(&mut self, _col: usize, row: usize) -> Result<(), StoreError> {
        self.with_builder(|b, _| b.modify(row));
        Ok(())
    }

    fn select_link_list(&mut self, col: usize, row: usize) -> Result<(), StoreError> {
        let current = self.current_table;
        self.active_list = self.info.lists.iter().position(|entry| {
            let list = &entry.list;
            list.table == current && list.col == col && list.is_alive() && list.row() == row
        });
        Ok(())
    }

    fn list_set(&mut self, index: usize) -> Result<(), StoreError> {
        self.with_list(|b| b.modify(index));
        Ok(())
    }

    fn list_insert(&mut self, index: usize) -> Result<(), StoreError> {
        self.with_list(|b| b.insert(index, 1, true));
        Ok(())
    }

    fn list_erase(&mut self, index: usize) -> Result<(), StoreError> {
        self.with_list(|b| b.erase(index));
        Ok(())
    }

    fn list_swap(&mut self, a: usize, b: usize) -> Result<(), StoreError> {
        self.with_list(|builder| {
            builder.modify(a);
            builder.modify(b);
        });
        Ok(())
    }

    fn list_move(&mut self, from: usize, to: usize) -> Result<(), StoreError> {
        if from != to {
            self.with_list(|b| b.move_row(from, to));
        }
        Ok(())
    }

    fn list_clear(&mut self, prev_size: usize) -> Result<(), StoreError> {
        self.with_list(|b| b.clear(prev_size));
        Ok(())
    }

    fn parse_complete(&mut self) {
        for builder in &mut self.info.tables {
            builder.parse_complete();
        }
        for list in &self.info.lists {
            list.changes.lock().parse_complete();
        }
    }
}
