use lodestone_changeset::IndexSet;
use lodestone_store::{ColumnKind, StoreHandle};

use crate::txlog::TransactionChangeInfo;

/// Hard limit on how many links deep the modification search goes.
const MAX_DEPTH: usize = 16;

#[derive(Clone, Copy)]
pub(crate) struct OutgoingLink {
    pub(crate) col: usize,
    pub(crate) is_list: bool,
    pub(crate) target: usize,
}

/// A table reachable from a notifier's root table, along with its outgoing
/// link columns.
pub(crate) struct RelatedTable {
    pub(crate) table: usize,
    pub(crate) links: Vec<OutgoingLink>,
}

/// Recursively add `table` and every table it links to to `out`.
pub(crate) fn find_related_tables(out: &mut Vec<RelatedTable>, handle: &StoreHandle, table: usize) {
    if out.iter().any(|t| t.table == table) {
        return;
    }
    // Push before recursing so the check above terminates cycles; the entry
    // is looked up by position afterwards because recursion may reallocate
    let index = out.len();
    out.push(RelatedTable {
        table,
        links: Vec::new(),
    });

    let Ok(tbl) = handle.table(table) else { return };
    for col in 0..tbl.column_count() {
        let (target, is_list) = match tbl.column_kind(col) {
            Ok(ColumnKind::Link { target }) => (target, false),
            Ok(ColumnKind::LinkList { target }) => (target, true),
            _ => continue,
        };
        out[index].links.push(OutgoingLink { col, is_list, target });
        find_related_tables(out, handle, target);
    }
}

#[derive(Clone, Copy, Default)]
struct PathEntry {
    table: usize,
    row: usize,
    col: usize,
    depth_exceeded: bool,
}

/// Answers "was this row, or anything reachable from it by links, modified
/// in the current transition?" with negative-answer memoization and cycle
/// protection.
pub(crate) struct DeepChangeChecker<'a> {
    info: &'a TransactionChangeInfo,
    handle: &'a StoreHandle,
    root_table: usize,
    related: &'a [RelatedTable],
    // Memoized "not modified" rows per table index
    not_modified: Vec<IndexSet>,
    path: [PathEntry; MAX_DEPTH],
}

impl<'a> DeepChangeChecker<'a> {
    pub(crate) fn new(
        info: &'a TransactionChangeInfo,
        handle: &'a StoreHandle,
        root_table: usize,
        related: &'a [RelatedTable],
    ) -> Self {
        Self {
            info,
            handle,
            root_table,
            related,
            not_modified: Vec::new(),
            path: [PathEntry::default(); MAX_DEPTH],
        }
    }

    pub(crate) fn row_changed(&mut self, row: usize) -> bool {
        if self.info.row_modified(self.root_table, row) {
            return true;
        }
        self.check_row(self.root_table, row, 0)
    }

    fn check_row(&mut self, table: usize, row: usize, depth: usize) -> bool {
        if depth >= MAX_DEPTH {
            // Don't mark the rows along this path as not-modified: a search
            // starting closer to them might still reach a modification
            for entry in &mut self.path[1..] {
                entry.depth_exceeded = true;
            }
            return false;
        }

        if depth > 0 && self.info.row_modified(table, row) {
            return true;
        }

        if self.not_modified.len() <= table {
            self.not_modified.resize_with(table + 1, IndexSet::new);
        }
        if self.not_modified[table].contains(row) {
            return false;
        }

        let changed = self.check_outgoing_links(table, row, depth);
        if !changed && !self.path[depth].depth_exceeded {
            self.not_modified[table].add(row);
        }
        changed
    }

    fn check_outgoing_links(&mut self, table: usize, row: usize, depth: usize) -> bool {
        let Some(related) = self.related.iter().find(|t| t.table == table) else {
            return false;
        };

        for i in 0..related.links.len() {
            let link = related.links[i];
            // Cycle check: skip the edge if it is already on the path
            if self.path[..depth]
                .iter()
                .any(|p| p.table == table && p.row == row && p.col == link.col)
            {
                continue;
            }
            self.path[depth] = PathEntry {
                table,
                row,
                col: link.col,
                depth_exceeded: false,
            };

            let Ok(tbl) = self.handle.table(table) else { continue };
            if link.is_list {
                let Ok(targets) = tbl.link_list(row, link.col) else { continue };
                for &dst in targets {
                    if self.check_row(link.target, dst, depth + 1) {
                        return true;
                    }
                }
            } else {
                let Ok(Some(dst)) = tbl.link(row, link.col) else { continue };
                if self.check_row(link.target, dst, depth + 1) {
                    return true;
                }
            }
        }

        false
    }
}

/// The modification predicate a notifier hands to the diff: a cheap "never"
/// when none of the reachable tables saw a modification, the deep checker
/// otherwise.
pub(crate) enum ModificationChecker<'a> {
    Never,
    Deep(DeepChangeChecker<'a>),
}

impl ModificationChecker<'_> {
    pub(crate) fn changed(&mut self, row: usize) -> bool {
        match self {
            ModificationChecker::Never => false,
            ModificationChecker::Deep(checker) => checker.row_changed(row),
        }
    }
}

pub(crate) fn modification_checker<'a>(
    info: &'a TransactionChangeInfo,
    handle: &'a StoreHandle,
    root_table: usize,
    related: &'a [RelatedTable],
) -> ModificationChecker<'a> {
    // If nothing reachable from the root was modified there is no point
    // walking the object graph row by row
    if related.iter().any(|t| info.table_modified(t.table)) {
        ModificationChecker::Deep(DeepChangeChecker::new(info, handle, root_table, related))
    } else {
        ModificationChecker::Never
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txlog::ChangeInfoParser;
    use lodestone_store::{
        ColumnSpec, LogOp, NullObserver, ReplayObserver, SharedStore, TableSpec, Value,
    };

    // Three tables: person links to address, team holds a list of persons.
    // person also links to itself (boss) to exercise cycle protection.
    fn test_store() -> std::sync::Arc<SharedStore> {
        SharedStore::new(vec![
            TableSpec::new(
                "person",
                vec![
                    ColumnSpec::value("name"),
                    ColumnSpec::link("address", 1),
                    ColumnSpec::link("boss", 0),
                ],
            ),
            TableSpec::new("address", vec![ColumnSpec::value("street")]),
            TableSpec::new("team", vec![ColumnSpec::link_list("members", 0)]),
        ])
    }

    fn parsed_info(tables: &[usize], ops: &[LogOp]) -> TransactionChangeInfo {
        let mut info = TransactionChangeInfo::default();
        for &t in tables {
            info.mark_table_needed(t);
        }
        let mut parser = ChangeInfoParser::new(&mut info);
        for op in ops {
            op.dispatch(&mut parser).unwrap();
        }
        parser.parse_complete();
        info
    }

    #[test]
    fn related_tables_cover_the_link_graph() {
        let store = test_store();
        let handle = store.handle();

        let mut related = Vec::new();
        find_related_tables(&mut related, &handle, 2);
        let tables: Vec<usize> = related.iter().map(|t| t.table).collect();
        assert_eq!(tables, [2, 0, 1]);

        // person's self-link appears once despite the cycle
        let person = related.iter().find(|t| t.table == 0).unwrap();
        assert_eq!(person.links.len(), 2);
    }

    #[test]
    fn direct_and_transitive_modifications() {
        let store = test_store();
        let mut handle = store.handle();
        handle.begin_write(&mut NullObserver).unwrap();
        let addr = handle.insert_row(1).unwrap();
        let person = handle.insert_row(0).unwrap();
        handle.set_link(0, person, 1, Some(addr)).unwrap();
        let loner = handle.insert_row(0).unwrap();
        handle.commit().unwrap();

        let mut related = Vec::new();
        find_related_tables(&mut related, &handle, 0);

        // Modify the address row
        let info = parsed_info(
            &[0, 1],
            &[
                LogOp::SelectTable { table: 1 },
                LogOp::SetValue { col: 0, row: addr, value: Value::Null },
            ],
        );
        let mut checker = modification_checker(&info, &handle, 0, &related);
        assert!(checker.changed(person));
        assert!(!checker.changed(loner));

        // No modifications anywhere: the cheap path answers
        let info = parsed_info(&[0, 1], &[]);
        let checker = modification_checker(&info, &handle, 0, &related);
        assert!(matches!(checker, ModificationChecker::Never));
    }

    #[test]
    fn self_link_cycles_terminate() {
        let store = test_store();
        let mut handle = store.handle();
        handle.begin_write(&mut NullObserver).unwrap();
        let a = handle.insert_row(0).unwrap();
        let b = handle.insert_row(0).unwrap();
        // a and b are each other's boss
        handle.set_link(0, a, 2, Some(b)).unwrap();
        handle.set_link(0, b, 2, Some(a)).unwrap();
        let addr = handle.insert_row(1).unwrap();
        handle.commit().unwrap();

        let mut related = Vec::new();
        find_related_tables(&mut related, &handle, 0);

        let info = parsed_info(
            &[0, 1],
            &[
                LogOp::SelectTable { table: 1 },
                LogOp::SetValue { col: 0, row: addr, value: Value::Null },
            ],
        );
        let mut checker = modification_checker(&info, &handle, 0, &related);
        // Neither a nor b reaches the modified address; the cycle must not
        // hang or overflow
        assert!(!checker.changed(a));
        assert!(!checker.changed(b));
    }

    #[test]
    fn list_links_are_followed() {
        let store = test_store();
        let mut handle = store.handle();
        handle.begin_write(&mut NullObserver).unwrap();
        let p = handle.insert_row(0).unwrap();
        let team = handle.insert_row(2).unwrap();
        handle.list_insert(2, team, 0, 0, p).unwrap();
        handle.commit().unwrap();

        let mut related = Vec::new();
        find_related_tables(&mut related, &handle, 2);

        let info = parsed_info(
            &[0, 1, 2],
            &[
                LogOp::SelectTable { table: 0 },
                LogOp::SetValue { col: 0, row: p, value: Value::Bool(true) },
            ],
        );
        let mut checker = modification_checker(&info, &handle, 2, &related);
        assert!(checker.changed(team));
    }
}
