use itertools::{EitherOrBoth, Itertools};

use crate::{ChangeBuilder, IndexSet, Move};

/// A row surviving from the previous state of a view to the next.
struct RowInfo {
    /// Stable row identity (the row's index within its table).
    row_index: usize,
    /// The row's position in the previous view, if it was present there.
    prev_tv_index: Option<usize>,
    /// The row's position in the view this entry was built from.
    tv_index: usize,
    /// `prev_tv_index` adjusted downwards for rows deleted before it.
    shifted_tv_index: usize,
}

impl ChangeBuilder {
    /// Diff two observed states of a result view.
    ///
    /// `prev_rows` holds the identity of each row in the previous state,
    /// already remapped into current coordinates (`None` marks a row known
    /// to have been deleted). `next_rows` holds the identities in the new
    /// state. `row_did_change` reports whether a surviving row should be
    /// marked modified.
    ///
    /// When `rows_are_in_table_order` is set the view is known to be in
    /// table order, where the only possible reordering is move-last-over
    /// (which moves rows exclusively toward smaller indices) and a single
    /// forward pass recovers the moves. Otherwise the view may be sorted
    /// arbitrarily and the realignment is derived from a longest common
    /// subsequence of the two states.
    pub fn calculate(
        prev_rows: &[Option<usize>],
        next_rows: &[usize],
        mut row_did_change: impl FnMut(usize) -> bool,
        rows_are_in_table_order: bool,
    ) -> ChangeBuilder {
        debug_assert!(!rows_are_in_table_order || next_rows.is_sorted());

        let mut ret = ChangeBuilder::new();

        let mut deleted = 0;
        let mut old_rows = Vec::with_capacity(prev_rows.len());
        for (i, &row) in prev_rows.iter().enumerate() {
            match row {
                None => {
                    deleted += 1;
                    ret.deletions.add(i);
                }
                Some(row_index) => old_rows.push(RowInfo {
                    row_index,
                    prev_tv_index: None,
                    tv_index: i,
                    shifted_tv_index: i - deleted,
                }),
            }
        }
        old_rows.sort_unstable_by_key(|r| (r.row_index, r.tv_index));

        let mut new_rows: Vec<RowInfo> = next_rows
            .iter()
            .enumerate()
            .map(|(i, &row_index)| RowInfo {
                row_index,
                prev_tv_index: None,
                tv_index: i,
                shifted_tv_index: 0,
            })
            .collect();
        new_rows.sort_unstable_by_key(|r| (r.row_index, r.tv_index));

        // Rows which were modified out of the view need to stay separate
        // from outright deletions until the unsorted move pass has run
        let mut removed = IndexSet::new();

        // Walk the two sides in row-identity order, recording old and new
        // positions for rows present in both and marking the rest as
        // removed or inserted. Duplicated identities pair up one-to-one in
        // position order.
        for pair in old_rows
            .iter()
            .merge_join_by(new_rows.iter_mut(), |o, n| o.row_index.cmp(&n.row_index))
        {
            match pair {
                EitherOrBoth::Both(old, new) => {
                    new.prev_tv_index = Some(old.tv_index);
                    new.shifted_tv_index = old.shifted_tv_index;
                }
                EitherOrBoth::Left(old) => removed.add(old.tv_index),
                EitherOrBoth::Right(new) => ret.insertions.add(new.tv_index),
            }
        }

        // The new insertions play no part in the remaining calculations
        new_rows.retain(|r| r.prev_tv_index.is_some());
        new_rows.sort_unstable_by_key(|r| r.tv_index);

        for row in &new_rows {
            if row_did_change(row.row_index) {
                ret.modifications.add(row.tv_index);
            }
        }

        if rows_are_in_table_order {
            calculate_moves_unsorted(&new_rows, &mut removed, &mut ret);
        } else {
            calculate_moves_sorted(&new_rows, &mut ret);
        }
        ret.deletions.add_set(&removed);
        ret.verify();

        #[cfg(debug_assertions)]
        {
            // Replaying the changeset over the previous state must
            // reproduce the new one exactly
            let mut rows: Vec<Option<usize>> = prev_rows.to_vec();
            for (lo, hi) in ret.deletions.ranges().rev() {
                rows.drain(lo..hi);
            }
            for i in ret.insertions.iter() {
                rows.insert(i, Some(next_rows[i]));
            }
            assert!(
                rows.iter().copied().eq(next_rows.iter().map(|&r| Some(r))),
                "replaying {ret:?} over {prev_rows:?} did not produce {next_rows:?}"
            );
        }

        ret
    }
}

/// Move detection for views in table order: the only reordering primitive is
/// move-last-over, so any row found earlier than its expected monotone
/// position has moved.
fn calculate_moves_unsorted(new_rows: &[RowInfo], removed: &mut IndexSet, change: &mut ChangeBuilder) {
    let mut expected = 0;
    for row in new_rows {
        debug_assert!(row.shifted_tv_index >= expected);
        if row.shifted_tv_index == expected {
            expected += 1;
            continue;
        }

        // The row isn't simply the one after its predecessor, but it still
        // may not have moved if rows between the two were deleted
        let prev_tv = row.prev_tv_index.expect("insertions were filtered out");
        let calc_expected =
            row.tv_index - change.insertions.count_below(row.tv_index) + removed.count_below(prev_tv);
        if row.shifted_tv_index == calc_expected {
            expected = calc_expected + 1;
            continue;
        }

        change.moves.push(Move {
            from: prev_tv,
            to: row.tv_index,
        });
        change.insertions.add(row.tv_index);
        removed.add(prev_tv);
    }
}

/// A row identity paired with a view position.
#[derive(Clone, Copy)]
struct RowPos {
    row_index: usize,
    tv_index: usize,
}

/// A contiguous block common to both sequences.
#[derive(Clone, Copy)]
struct Block {
    /// Starting position in `a`.
    i: usize,
    /// Starting position in `b` (surviving-subsequence coordinates).
    j: usize,
    len: usize,
    /// Lazily computed count of modified rows covered by the block.
    modified: Option<usize>,
}

/// Move detection for sorted views: realign the previous order to the new
/// one by deleting and re-inserting everything outside a longest common
/// subsequence of the two.
fn calculate_moves_sorted(rows: &[RowInfo], change: &mut ChangeBuilder) {
    // The old order: row identities sorted by their previous view position
    let mut a: Vec<RowPos> = rows
        .iter()
        .map(|r| RowPos {
            row_index: r.row_index,
            tv_index: r.prev_tv_index.expect("insertions were filtered out"),
        })
        .collect();
    a.sort_unstable_by_key(|r| (r.tv_index, r.row_index));

    // Skip everything before the first position where the order differs
    let Some(first_difference) = a
        .iter()
        .zip(rows)
        .position(|(old, new)| old.row_index != new.row_index)
    else {
        return;
    };

    // A row-identity index into the new order. `tv_index` here is the
    // position within the surviving subsequence, not the full view.
    let mut b: Vec<RowPos> = rows
        .iter()
        .enumerate()
        .map(|(i, r)| RowPos {
            row_index: r.row_index,
            tv_index: i,
        })
        .collect();
    b.sort_unstable_by_key(|r| (r.row_index, r.tv_index));

    let modified_in_block = |start: usize, len: usize| {
        (start..start + len)
            .filter(|&j| change.modifications.contains(rows[j].tv_index))
            .count()
    };
    let matches = longest_common_subsequence(&a, &b, first_difference, &modified_in_block);

    // Delete and insert whatever falls between the matched blocks
    let (mut i, mut j) = (first_difference, first_difference);
    for m in matches {
        while i < m.i {
            change.deletions.add(a[i].tv_index);
            i += 1;
        }
        while j < m.j {
            change.insertions.add(rows[j].tv_index);
            j += 1;
        }
        i += m.len;
        j += m.len;
    }
}

/// The longest common subsequence of `a` and `b` (matching on row identity),
/// as a sequence of contiguous blocks in ascending order, terminated by a
/// zero-length sentinel at the end of both sequences.
///
/// Uses the O(N)-auxiliary-space form of the dynamic program, where N is the
/// highest multiplicity of a single row identity (one, except for views over
/// lists which can contain a row twice). The divide-and-conquer pass runs on
/// an explicit work stack, keeping the recursion depth off the call stack.
fn longest_common_subsequence(
    a: &[RowPos],
    b: &[RowPos],
    start: usize,
    modified_in_block: &dyn Fn(usize, usize) -> usize,
) -> Vec<Block> {
    enum Task {
        Search {
            begin1: usize,
            end1: usize,
            begin2: usize,
            end2: usize,
        },
        Emit(Block),
    }

    let mut matches = Vec::new();
    let mut stack = vec![Task::Search {
        begin1: start,
        end1: a.len(),
        begin2: start,
        end2: b.len(),
    }];
    while let Some(task) = stack.pop() {
        match task {
            Task::Emit(block) => matches.push(block),
            Task::Search {
                begin1,
                end1,
                begin2,
                end2,
            } => {
                let m = find_longest_match(a, b, begin1, end1, begin2, end2, modified_in_block);
                if m.len == 0 {
                    continue;
                }
                // Pushed in reverse order so the left half is fully
                // processed before the block is emitted
                if m.i + m.len < end1 && m.j + m.len < end2 {
                    stack.push(Task::Search {
                        begin1: m.i + m.len,
                        end1,
                        begin2: m.j + m.len,
                        end2,
                    });
                }
                stack.push(Task::Emit(m));
                if m.i > begin1 && m.j > begin2 {
                    stack.push(Task::Search {
                        begin1,
                        end1: m.i,
                        begin2,
                        end2: m.j,
                    });
                }
            }
        }
    }

    matches.push(Block {
        i: a.len(),
        j: b.len(),
        len: 0,
        modified: None,
    });
    matches
}

/// Find the longest contiguous matching block within the given bounds.
/// Among equal-length candidates, prefer the one covering fewer modified
/// rows, then the one starting earliest in the new sequence.
fn find_longest_match(
    a: &[RowPos],
    b: &[RowPos],
    begin1: usize,
    end1: usize,
    begin2: usize,
    end2: usize,
    modified_in_block: &dyn Fn(usize, usize) -> usize,
) -> Block {
    // (j, len) of the matching block ending at each j, for the previous
    // and current values of i
    let mut prev: Vec<(usize, usize)> = Vec::new();
    let mut cur: Vec<(usize, usize)> = Vec::new();

    let mut best = Block {
        i: begin1,
        j: begin2,
        len: 0,
        modified: None,
    };
    for i in begin1..end1 {
        std::mem::swap(&mut prev, &mut cur);
        cur.clear();

        // Every position at which a[i]'s row appears in the new sequence.
        // There is always at least one (pure removals were filtered out
        // before the diff), but duplicates can produce several.
        let ai = a[i].row_index;
        let lower = b.partition_point(|r| r.row_index < ai);
        debug_assert!(lower < b.len() && b[lower].row_index == ai);
        for entry in &b[lower..] {
            if entry.row_index != ai {
                break;
            }
            let j = entry.tv_index;
            if j < begin2 {
                continue;
            }
            if j >= end2 {
                break; // b is sorted by tv_index within one row identity
            }

            // The block ending at b[j] extends the one ending at b[j-1]
            // for the previous row, if any
            let len = prev
                .iter()
                .find(|&&(prev_j, _)| prev_j + 1 == j)
                .map_or(1, |&(_, len)| len + 1);
            cur.push((j, len));

            if len > best.len {
                best = Block {
                    i: i + 1 - len,
                    j: j + 1 - len,
                    len,
                    modified: None,
                };
            } else if len == best.len {
                let best_count =
                    *best.modified.get_or_insert_with(|| modified_in_block(best.j, best.len));
                let count = modified_in_block(j + 1 - len, len);
                if count < best_count || (count == best_count && j + 1 - len < best.j) {
                    best = Block {
                        i: i + 1 - len,
                        j: j + 1 - len,
                        len,
                        modified: Some(count),
                    };
                }
            }

            debug_assert!(best.i >= begin1 && best.i + best.len <= end1);
            debug_assert!(best.j >= begin2 && best.j + best.len <= end2);
        }
    }
    best
}
