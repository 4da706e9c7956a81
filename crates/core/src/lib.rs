//! Change notification and asynchronous query engine.
//!
//! Clients open per-thread [`Snapshot`]s of a shared database. Whenever any
//! snapshot commits a write, a per-database background worker recomputes the
//! registered collection notifiers against the new version, packages the
//! resulting [`ChangeSet`]s, and wakes every delivery thread; the next
//! [`Snapshot::notify`] on each thread advances it to the computed version
//! and invokes the registered callbacks with a precise, minimal description
//! of how each observed collection evolved.
//!
//! The pieces, roughly bottom-up:
//!
//! - [`lodestone_changeset`] holds the change algebra itself;
//! - [`txlog`] translates the storage engine's transaction log into
//!   per-table change builders (and per-observer column deltas for
//!   [`BindingContext`] clients);
//! - [`notifier`] hosts the per-collection state machines
//!   ([`Results`]/[`List`] are their public faces);
//! - [`Coordinator`] owns the registry, the background worker, and the
//!   cross-process commit channel.

mod binding;
mod commit_helper;
mod config;
mod coordinator;
mod deep_change;
mod error;
mod notifier;
mod results;
mod snapshot;
mod txlog;

pub use binding::{BindingContext, ColumnDelta, DeltaKind, ObservedRow, RowChangeInfo};
pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use notifier::{ChangeCallback, NotificationToken};
pub use results::{List, Results};
pub use snapshot::Snapshot;

pub use lodestone_changeset::{ChangeSet as CollectionChangeSet, ChangeSet, IndexSet, Move};
pub use lodestone_store::{
    ColumnKind, ColumnSpec, Filter, Query, SortColumn, SortOrder, TableSpec, Value, Version,
};
