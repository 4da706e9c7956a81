use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use crate::{ChangeSet, IndexSet, Move};

/// Mutable accumulator for a [`ChangeSet`].
///
/// A builder is fed either by the row-level mutation primitives (`insert`,
/// `erase`, `move_row`, `move_over`, `clear`, `modify`) while a transaction
/// log is replayed, or wholesale by [`merge`](Self::merge) when two
/// consecutive changesets are composed into one, or by
/// [`calculate`](Self::calculate) which diffs two observed states of a
/// result sequence.
///
/// All primitives take their index arguments in the coordinate space of the
/// collection *at the time of the mutation*, exactly as a transaction log
/// reports them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeBuilder {
    change: ChangeSet,
    // Scratch mapping from a move's destination row to its unshifted source
    // row. Populated by `move_over` while a log is parsed and drained into
    // `moves` by `parse_complete`.
    move_map: BTreeMap<usize, usize>,
}

impl Deref for ChangeBuilder {
    type Target = ChangeSet;

    fn deref(&self) -> &ChangeSet {
        &self.change
    }
}

impl DerefMut for ChangeBuilder {
    fn deref_mut(&mut self) -> &mut ChangeSet {
        &mut self.change
    }
}

impl From<ChangeBuilder> for ChangeSet {
    fn from(builder: ChangeBuilder) -> ChangeSet {
        debug_assert!(builder.move_map.is_empty());
        builder.change
    }
}

impl ChangeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pre-computed parts, registering each move's endpoints in
    /// `deletions`/`insertions`.
    pub fn from_parts(
        deletions: IndexSet,
        insertions: IndexSet,
        modifications: IndexSet,
        moves: Vec<Move>,
    ) -> Self {
        let mut builder = Self {
            change: ChangeSet {
                deletions,
                insertions,
                modifications,
                moves,
            },
            move_map: BTreeMap::new(),
        };
        for i in 0..builder.change.moves.len() {
            let m = builder.change.moves[i];
            builder.change.deletions.add(m.from);
            builder.change.insertions.add(m.to);
        }
        builder
    }

    pub fn into_change_set(self) -> ChangeSet {
        self.into()
    }

    /// Mark the row at `index` as modified.
    pub fn modify(&mut self, index: usize) {
        self.change.modifications.add(index);
    }

    /// `count` rows were inserted at `index`.
    ///
    /// `track_moves` is false for builders which only report modifications
    /// (no structural change information was requested for the table).
    pub fn insert(&mut self, index: usize, count: usize, track_moves: bool) {
        self.change.modifications.shift_for_insert_at(index, count);
        if !track_moves {
            return;
        }
        self.change.insertions.insert_at(index, count);
        for m in &mut self.change.moves {
            if m.to >= index {
                m.to += count;
            }
        }
    }

    /// The row at `index` was removed, shifting the rows above it down.
    pub fn erase(&mut self, index: usize) {
        self.change.modifications.erase_at(index);
        if let Some(unshifted) = self.change.insertions.erase_or_unshift(index) {
            self.change.deletions.add_shifted(unshifted);
        }
        self.change.moves.retain_mut(|m| {
            if m.to == index {
                return false;
            }
            if m.to > index {
                m.to -= 1;
            }
            true
        });
    }

    /// Every row was removed. `prev_size` is the collection's size at the
    /// time of the clear; the baseline size is recovered by backing out the
    /// insertions and deletions already recorded.
    pub fn clear(&mut self, mut prev_size: usize) {
        for (lo, hi) in self.change.deletions.ranges() {
            prev_size += hi - lo;
        }
        for (lo, hi) in self.change.insertions.ranges() {
            prev_size -= hi - lo;
        }
        self.change.modifications.clear();
        self.change.insertions.clear();
        self.change.moves.clear();
        self.move_map.clear();
        self.change.deletions.set(prev_size);
    }

    /// The row at `from` was moved to `to` (an ordered-collection move, as
    /// produced by list mutations).
    pub fn move_row(&mut self, from: usize, to: usize) {
        assert_ne!(from, to);
        let ChangeSet {
            deletions,
            insertions,
            modifications,
            moves,
        } = &mut self.change;

        let mut updated_existing_move = false;
        for m in moves.iter_mut() {
            if m.to != from {
                // Shift other moves if this row moved from one side of them
                // to the other
                if m.to >= to && m.to < from {
                    m.to += 1;
                } else if m.to <= to && m.to > from {
                    m.to -= 1;
                }
                continue;
            }
            debug_assert!(!updated_existing_move);

            // Collapse A -> B, B -> C into a single A -> C move
            m.to = to;
            updated_existing_move = true;

            insertions.erase_at(from);
            insertions.insert_at(to, 1);
        }

        if !updated_existing_move {
            let unshifted = insertions.erase_or_unshift(from);
            insertions.insert_at(to, 1);

            // Don't report deletions/moves for newly inserted rows
            if let Some(unshifted) = unshifted {
                let shifted = deletions.add_shifted(unshifted);
                moves.push(Move { from: shifted, to });
            }
        }

        let modified = modifications.contains(from);
        modifications.erase_at(from);
        if modified {
            modifications.insert_at(to, 1);
        } else {
            modifications.shift_for_insert_at(to, 1);
        }
    }

    /// The storage engine's move-last-over primitive: the row at `last_row`
    /// (the current last row) overwrote the row at `row` and the collection
    /// shrank by one.
    pub fn move_over(&mut self, row: usize, last_row: usize, track_moves: bool) {
        debug_assert!(row <= last_row);
        let ChangeSet {
            deletions,
            insertions,
            modifications,
            ..
        } = &mut self.change;
        debug_assert!(insertions.ranges().next_back().is_none_or(|r| r.1 <= last_row + 1));
        debug_assert!(modifications.ranges().next_back().is_none_or(|r| r.1 <= last_row + 1));

        if row == last_row {
            if track_moves {
                if let Some(unshifted) = insertions.erase_or_unshift(row) {
                    deletions.add_shifted(unshifted);
                }
                self.move_map.remove(&row);
            }
            modifications.remove(row);
            return;
        }

        let modified = modifications.contains(last_row);
        if modified {
            modifications.remove(last_row);
            modifications.add(row);
        } else {
            modifications.remove(row);
        }

        if !track_moves {
            return;
        }

        let row_is_insertion = insertions.contains(row);
        let last_is_insertion = insertions.ranges().next_back().is_some_and(|r| r.1 == last_row + 1);

        // Collapse A -> B, B -> C into a single A -> C move
        let mut last_was_already_moved = false;
        if last_is_insertion {
            if let Some(source) = self.move_map.remove(&last_row) {
                self.move_map.insert(row, source);
                last_was_already_moved = true;
            }
        }

        // Remove moves to the row being overwritten
        if row_is_insertion && !last_was_already_moved {
            self.move_map.remove(&row);
        }

        // Don't report deletions/moves if last_row is newly inserted. If it
        // was previously moved, the unshifted source row has already been
        // marked as deleted.
        if last_is_insertion {
            insertions.remove(last_row);
        } else if !last_was_already_moved {
            let shifted_last = deletions.add_shifted(insertions.unshift(last_row));
            self.move_map.insert(row, shifted_last);
        }

        // Don't mark the moved-over row as deleted if it was a new insertion
        if !row_is_insertion {
            deletions.add_shifted(insertions.unshift(row));
            insertions.add(row);
        }
        self.verify();
    }

    /// Transfer the accumulated move mapping into `moves`, sorted by source
    /// index. Called once when a transaction log has been fully replayed.
    pub fn parse_complete(&mut self) {
        self.change.moves.reserve(self.move_map.len());
        for (&to, &from) in &self.move_map {
            debug_assert!(self.change.deletions.contains(from));
            debug_assert!(self.change.insertions.contains(to));
            self.change.moves.push(Move { from, to });
        }
        self.move_map.clear();
        self.change.moves.sort_unstable_by_key(|m| m.from);
    }

    /// Compose `other` onto `self`: afterwards `self` describes the combined
    /// transition `self ; other` as a single changeset.
    pub fn merge(&mut self, mut other: ChangeBuilder) {
        debug_assert!(self.move_map.is_empty() && other.move_map.is_empty());
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other;
            return;
        }

        self.verify();
        other.verify();

        let ChangeSet {
            deletions,
            insertions,
            modifications,
            moves,
        } = &mut self.change;
        let ChangeSet {
            deletions: new_deletions,
            insertions: new_insertions,
            modifications: new_modifications,
            moves: new_moves,
        } = &mut other.change;

        // First update any old moves
        if !new_moves.is_empty() || !new_deletions.is_empty() || !new_insertions.is_empty() {
            moves.retain_mut(|old| {
                // If the moved row was moved again, just update the destination
                if let Some(pos) = new_moves.iter().position(|m| old.to == m.from) {
                    let chased = new_moves.swap_remove(pos);
                    if modifications.contains(chased.from) {
                        new_modifications.add(chased.to);
                    }
                    old.to = chased.to;
                    return true;
                }

                // If the destination was deleted the move is dropped entirely;
                // removing the insert side happens below
                if new_deletions.contains(old.to) {
                    return false;
                }

                // Adjust the destination for the new insertions and deletions
                old.to = new_insertions.shift(new_deletions.unshift(old.to));
                true
            });
        }

        // Ignore new moves of rows which were previously inserted (the
        // implicit delete from the move will remove the insert)
        if !insertions.is_empty() && !new_moves.is_empty() {
            new_moves.retain(|m| !insertions.contains(m.from));
        }

        // Ensure that previously modified rows which were moved stay modified
        if !modifications.is_empty() && !new_moves.is_empty() {
            for m in new_moves.iter() {
                if modifications.contains(m.from) {
                    new_modifications.add(m.to);
                }
            }
        }

        // Rebase the source of new moves into the old coordinate space
        if !deletions.is_empty() || !insertions.is_empty() {
            for m in new_moves.iter_mut() {
                m.from = deletions.shift(insertions.unshift(m.from));
            }
        }
        moves.append(new_moves);

        // New deletion indices were shifted by the old insertions, so unshift
        // them before adding
        deletions.add_shifted_by(insertions, new_deletions);

        // Drop inserted-then-deleted rows, then layer the new insertions
        insertions.erase_at_set(new_deletions);
        insertions.insert_at_set(new_insertions);

        clean_up_stale_moves(moves, deletions, insertions);

        modifications.erase_at_set(new_deletions);
        modifications.shift_for_insert_at_set(new_insertions);
        modifications.add_set(new_modifications);

        self.verify();
    }

    /// Assert invariant 1 (`moves ⊆ deletions × insertions`) in debug builds.
    pub fn verify(&self) {
        #[cfg(debug_assertions)]
        for m in &self.change.moves {
            assert!(
                self.change.deletions.contains(m.from),
                "move source {} missing from deletions {:?}",
                m.from,
                self.change.deletions
            );
            assert!(
                self.change.insertions.contains(m.to),
                "move destination {} missing from insertions {:?}",
                m.to,
                self.change.insertions
            );
        }
    }
}

/// Remove moves which have become no-ops, along with their entries in
/// `deletions` and `insertions`. This is not just `from == to`: rows can
/// also be shifted into place by the surrounding inserts and deletes.
fn clean_up_stale_moves(moves: &mut Vec<Move>, deletions: &mut IndexSet, insertions: &mut IndexSet) {
    moves.retain(|m| {
        if m.from - deletions.count_below(m.from) != m.to - insertions.count_below(m.to) {
            return true;
        }
        deletions.remove(m.from);
        insertions.remove(m.to);
        false
    });
}
