//! Index sets and the collection change algebra.
//!
//! A [`ChangeSet`] describes how an ordered collection evolved across one
//! snapshot transition as sets of row indices ([`IndexSet`]) plus a list of
//! [`Move`]s. [`ChangeBuilder`] produces changesets three ways:
//!
//! - by applying row-level mutation primitives while a transaction log is
//!   replayed ([`ChangeBuilder::insert`], [`ChangeBuilder::erase`], ...),
//! - by composing two consecutive changesets into one ([`ChangeBuilder::merge`]),
//! - by diffing two observed states of a result sequence
//!   ([`ChangeBuilder::calculate`]).

mod builder;
mod change_set;
mod diff;
mod index_set;

pub use builder::ChangeBuilder;
pub use change_set::{ChangeSet, Move};
pub use index_set::IndexSet;
