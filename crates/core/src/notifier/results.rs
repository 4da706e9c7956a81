use std::sync::{Arc, Weak};

use lodestone_changeset::ChangeBuilder;
use lodestone_store::{Handover, Query, SortOrder, StoreHandle, TableView};
use parking_lot::Mutex;

use crate::coordinator::Coordinator;
use crate::deep_change::{find_related_tables, modification_checker, RelatedTable};
use crate::notifier::{CollectionNotifier, DeliverStatus, NotifierBase};
use crate::results::ResultsTarget;
use crate::txlog::TransactionChangeInfo;
use crate::{Error, Result, Snapshot};

// Everything here is touched only by the worker thread; the mutex is for
// the brief reads `deliver` and `add_required_change_info` perform.
#[derive(Default)]
struct RunState {
    related: Vec<RelatedTable>,
    previous_rows: Vec<Option<usize>>,
    initial_run_complete: bool,
    last_seen_version: Option<u64>,
    computed: Option<(TableView, ChangeBuilder)>,
}

/// Notifier for a sorted/filtered query: diffs consecutive materializations
/// of the result view and hands the new view over to the target.
pub(crate) struct ResultsNotifier {
    base: NotifierBase,
    // Target lock: the backref to the collection this notifier feeds
    target: Mutex<Option<Weak<ResultsTarget>>>,
    query: Query,
    sort: SortOrder,
    run_state: Mutex<RunState>,
    handover: Mutex<Option<Handover<TableView>>>,
}

impl ResultsNotifier {
    pub(crate) fn new(
        coordinator: &Arc<Coordinator>,
        snapshot: &Snapshot,
        query: Query,
        sort: SortOrder,
        target: Weak<ResultsTarget>,
    ) -> Arc<ResultsNotifier> {
        Arc::new(ResultsNotifier {
            base: NotifierBase::new(coordinator, snapshot.thread()),
            target: Mutex::new(Some(target)),
            query,
            sort,
            run_state: Mutex::new(RunState::default()),
            handover: Mutex::new(None),
        })
    }

    fn upgraded_target(&self) -> Option<Arc<ResultsTarget>> {
        self.target.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl CollectionNotifier for ResultsNotifier {
    fn base(&self) -> &NotifierBase {
        &self.base
    }

    fn is_alive(&self) -> bool {
        self.upgraded_target().is_some()
    }

    fn unregister(&self) {
        *self.target.lock() = None;
    }

    fn attach(&self, handle: &StoreHandle) {
        let mut state = self.run_state.lock();
        if state.related.is_empty() {
            find_related_tables(&mut state.related, handle, self.query.table);
        }
    }

    fn detach(&self) {
        let mut state = self.run_state.lock();
        state.related.clear();
        state.previous_rows.clear();
        state.initial_run_complete = false;
        state.last_seen_version = None;
        state.computed = None;
        *self.handover.lock() = None;
    }

    fn add_required_change_info(&self, info: &mut TransactionChangeInfo) {
        // The parser must always produce detailed moves for the root table,
        // so the previous result rows can be remapped before diffing
        info.mark_table_moves_needed(self.query.table);

        let state = self.run_state.lock();
        if state.initial_run_complete && self.base.have_callbacks() {
            for related in &state.related {
                info.mark_table_needed(related.table);
            }
        }
    }

    fn run(&self, handle: &StoreHandle, info: &TransactionChangeInfo) -> Result<()> {
        {
            // Don't run the query if nothing will consume the result
            let Some(target) = self.upgraded_target() else {
                return Ok(());
            };
            if !self.base.have_callbacks() && !target.wants_background_updates() {
                return Ok(());
            }
        }

        let mut state = self.run_state.lock();
        let state = &mut *state;

        // Versions only grow, so the sum over every reachable table moves
        // exactly when a rerun could produce different output (a change to
        // a linked table can alter modifications without touching the root)
        let related_version: u64 = state
            .related
            .iter()
            .filter_map(|t| handle.table(t.table).ok())
            .map(|t| t.version())
            .sum();
        if state.initial_run_complete && state.last_seen_version == Some(related_version) {
            state.computed = None;
            return Ok(());
        }

        let mut view = self
            .query
            .run(handle)
            .map_err(|e| Error::QueryExecution(e.to_string()))?;
        if !self.sort.is_empty() {
            view.sort(handle, &self.sort)
                .map_err(|e| Error::QueryExecution(e.to_string()))?;
        }
        state.last_seen_version = Some(related_version);

        if state.initial_run_complete {
            let next_rows: Vec<usize> = view.rows().to_vec();

            // Remap the previous result rows through the parsed table
            // changes: moved rows take their new index, deleted rows are
            // marked as gone
            if let Some(changes) = info.table_changes(self.query.table) {
                for slot in state.previous_rows.iter_mut() {
                    let Some(index) = *slot else { continue };
                    if let Ok(pos) = changes.moves.binary_search_by_key(&index, |m| m.from) {
                        *slot = Some(changes.moves[pos].to);
                    } else if changes.deletions.contains(index) {
                        *slot = None;
                    } else {
                        debug_assert!(!changes.insertions.contains(index));
                    }
                }
            }

            let mut checker = modification_checker(info, handle, self.query.table, &state.related);
            let changes = ChangeBuilder::calculate(
                &state.previous_rows,
                &next_rows,
                |row| checker.changed(row),
                self.sort.is_empty(),
            );

            state.previous_rows = next_rows.into_iter().map(Some).collect();
            state.computed = Some((view, changes));
        } else {
            state.previous_rows = view.rows().iter().copied().map(Some).collect();
            state.computed = Some((view, ChangeBuilder::new()));
        }
        Ok(())
    }

    fn prepare_handover(&self, handle: &StoreHandle) {
        let mut state = self.run_state.lock();
        self.base.set_pending_version(handle.version());
        if let Some((view, changes)) = state.computed.take() {
            state.initial_run_complete = true;
            self.base.add_changes(changes);
            *self.handover.lock() = Some(handle.export(view));
        }
    }

    fn reload(&self, handle: &StoreHandle) {
        let mut state = self.run_state.lock();
        state.initial_run_complete = false;
        state.previous_rows.clear();
        state.last_seen_version = None;
        state.computed = None;
        // Table indices may have been renumbered; rebuild the reachability
        // information from scratch
        state.related.clear();
        find_related_tables(&mut state.related, handle, self.query.table);
        self.base.clear_pending_changes();
        *self.handover.lock() = None;
    }

    fn deliver(&self, handle: &StoreHandle) -> bool {
        let Some(target) = self.upgraded_target() else {
            return false;
        };
        let initial_run_complete = self.run_state.lock().initial_run_complete;
        match self.base.deliver_common(handle.version(), initial_run_complete) {
            DeliverStatus::Skip => false,
            DeliverStatus::ErrorLatched(should_call) => should_call,
            DeliverStatus::Delivered(should_call) => {
                if let Some(envelope) = self.handover.lock().take() {
                    match handle.import(envelope) {
                        Ok(view) => target.set_view(view),
                        Err(_) => return false,
                    }
                }
                should_call
            }
        }
    }
}
