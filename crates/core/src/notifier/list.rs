use std::sync::{Arc, Weak};

use lodestone_changeset::ChangeBuilder;
use lodestone_store::StoreHandle;
use parking_lot::Mutex;

use crate::coordinator::Coordinator;
use crate::deep_change::{find_related_tables, modification_checker, RelatedTable};
use crate::notifier::{CollectionNotifier, DeliverStatus, NotifierBase};
use crate::results::ListTarget;
use crate::txlog::{ListChangeInfo, ListRef, TransactionChangeInfo};
use crate::{Result, Snapshot};

#[derive(Default)]
struct RunState {
    related: Vec<RelatedTable>,
    prev_size: usize,
}

/// Notifier for an ordered list-of-links collection. Structural changes are
/// parsed straight into the shared builder by the transaction-log parser;
/// `run` only adds modifications of the rows the list elements point at.
pub(crate) struct ListNotifier {
    base: NotifierBase,
    target: Mutex<Option<Weak<ListTarget>>>,
    list: Arc<ListRef>,
    /// The table the list's elements live in.
    element_table: usize,
    /// Written by the transaction-log parser while the worker advances.
    changes: Arc<Mutex<ChangeBuilder>>,
    run_state: Mutex<RunState>,
}

impl ListNotifier {
    pub(crate) fn new(
        coordinator: &Arc<Coordinator>,
        snapshot: &Snapshot,
        table: usize,
        row: usize,
        col: usize,
        element_table: usize,
        prev_size: usize,
        target: Weak<ListTarget>,
    ) -> Arc<ListNotifier> {
        Arc::new(ListNotifier {
            base: NotifierBase::new(coordinator, snapshot.thread()),
            target: Mutex::new(Some(target)),
            list: ListRef::new(table, row, col),
            element_table,
            changes: Arc::new(Mutex::new(ChangeBuilder::new())),
            run_state: Mutex::new(RunState {
                related: Vec::new(),
                prev_size,
            }),
        })
    }
}

impl CollectionNotifier for ListNotifier {
    fn base(&self) -> &NotifierBase {
        &self.base
    }

    fn is_alive(&self) -> bool {
        self.target.lock().as_ref().is_some_and(|t| t.strong_count() > 0)
    }

    fn unregister(&self) {
        *self.target.lock() = None;
    }

    fn attach(&self, handle: &StoreHandle) {
        let mut state = self.run_state.lock();
        if state.related.is_empty() {
            find_related_tables(&mut state.related, handle, self.element_table);
        }
    }

    fn detach(&self) {
        self.run_state.lock().related.clear();
        *self.changes.lock() = ChangeBuilder::new();
    }

    fn add_required_change_info(&self, info: &mut TransactionChangeInfo) {
        if !self.list.is_alive() {
            return;
        }
        // The parser feeds our builder directly as it walks the log
        info.add_list(ListChangeInfo {
            list: Arc::clone(&self.list),
            changes: Arc::clone(&self.changes),
        });
        let state = self.run_state.lock();
        for related in &state.related {
            info.mark_table_needed(related.table);
        }
    }

    fn run(&self, handle: &StoreHandle, info: &TransactionChangeInfo) -> Result<()> {
        let mut state = self.run_state.lock();

        if !self.list.is_alive() {
            // The origin row is gone: report every element as deleted, once
            let mut changes = self.changes.lock();
            *changes = ChangeBuilder::new();
            if state.prev_size > 0 {
                changes.deletions.set(state.prev_size);
                state.prev_size = 0;
            }
            return Ok(());
        }

        let row = self.list.row();
        let elements = handle
            .table(self.list.table)?
            .link_list(row, self.list.col)?
            .to_vec();

        let mut changes = self.changes.lock();
        let mut checker = modification_checker(info, handle, self.element_table, &state.related);

        for (index, &element) in elements.iter().enumerate() {
            if changes.modifications.contains(index) {
                continue;
            }
            if checker.changed(element) {
                changes.modifications.add(index);
            }
        }

        // Rows which moved within the list still need their targets checked
        let move_destinations: Vec<usize> = changes.moves.iter().map(|m| m.to).collect();
        for to in move_destinations {
            if changes.modifications.contains(to) {
                continue;
            }
            if let Some(&element) = elements.get(to) {
                if checker.changed(element) {
                    changes.modifications.add(to);
                }
            }
        }

        state.prev_size = elements.len();
        Ok(())
    }

    fn prepare_handover(&self, handle: &StoreHandle) {
        let changes = std::mem::take(&mut *self.changes.lock());
        self.base.add_changes(changes);
        self.base.set_pending_version(handle.version());
    }

    fn reload(&self, handle: &StoreHandle) {
        let mut state = self.run_state.lock();
        state.related.clear();
        find_related_tables(&mut state.related, handle, self.element_table);
        *self.changes.lock() = ChangeBuilder::new();
        self.base.clear_pending_changes();
    }

    fn deliver(&self, handle: &StoreHandle) -> bool {
        if self.target.lock().as_ref().and_then(Weak::upgrade).is_none() {
            return false;
        }
        match self.base.deliver_common(handle.version(), true) {
            DeliverStatus::Skip => false,
            DeliverStatus::ErrorLatched(should_call) | DeliverStatus::Delivered(should_call) => should_call,
        }
    }
}
