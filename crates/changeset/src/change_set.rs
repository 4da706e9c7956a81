use crate::IndexSet;

/// A row which moved from one position in a collection to another.
///
/// `from` is expressed in pre-transition coordinates and `to` in
/// post-transition coordinates, matching `deletions` and `insertions`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Move {
    pub from: usize,
    pub to: usize,
}

/// The set of changes to an ordered collection across one snapshot
/// transition.
///
/// Invariants maintained by every producer in this crate:
///
/// 1. every `Move` has its `from` in `deletions` and its `to` in
///    `insertions`;
/// 2. `deletions` is in pre-transition index space, while `insertions`,
///    `modifications` and `moves[].to` are in post-transition index space;
/// 3. applying `deletions` to the pre-transition sequence in descending
///    order and then `insertions` in ascending order yields the
///    post-transition sequence.
///
/// `modifications ∩ insertions = ∅` is additionally guaranteed for
/// changesets handed to user callbacks; while changes are being accumulated
/// the two sets can overlap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub deletions: IndexSet,
    pub insertions: IndexSet,
    pub modifications: IndexSet,
    pub moves: Vec<Move>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
            && self.insertions.is_empty()
            && self.modifications.is_empty()
            && self.moves.is_empty()
    }
}
