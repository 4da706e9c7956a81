use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lodestone_changeset::ChangeSet;
use lodestone_store::{ColumnKind, Query, SortOrder, TableView};
use parking_lot::Mutex;

use crate::notifier::list::ListNotifier;
use crate::notifier::results::ResultsNotifier;
use crate::notifier::{CollectionNotifier, NotificationToken, NotifierHandle};
use crate::{Error, Result, Snapshot};

/// The delivery-side state of a [`Results`]: the notifier holds a weak
/// reference to this and fills in the freshly computed view on delivery.
pub(crate) struct ResultsTarget {
    view: Mutex<Option<TableView>>,
    wants_background_updates: AtomicBool,
}

impl ResultsTarget {
    pub(crate) fn set_view(&self, view: TableView) {
        *self.view.lock() = Some(view);
    }

    pub(crate) fn wants_background_updates(&self) -> bool {
        self.wants_background_updates.load(Ordering::Acquire)
    }
}

struct Registration<N: ?Sized> {
    notifier: Arc<N>,
    _handle: NotifierHandle,
}

/// A query result collection which can deliver change notifications.
///
/// Bound to the thread of the snapshot it was created from; the actual
/// computation happens on the database's background worker, and callbacks
/// fire on this thread from [`Snapshot::notify`].
pub struct Results {
    snapshot: Arc<Snapshot>,
    query: Query,
    sort: SortOrder,
    target: Arc<ResultsTarget>,
    notifier: Mutex<Option<Registration<ResultsNotifier>>>,
}

impl Results {
    pub fn new(snapshot: Arc<Snapshot>, query: Query, sort: SortOrder) -> Results {
        Results {
            snapshot,
            query,
            sort,
            target: Arc::new(ResultsTarget {
                view: Mutex::new(None),
                wants_background_updates: AtomicBool::new(true),
            }),
            notifier: Mutex::new(None),
        }
    }

    /// Evaluate the query against the snapshot's current version.
    pub fn rows(&self) -> Result<Vec<usize>> {
        self.snapshot.verify_thread()?;
        let handle = self.snapshot.handle();
        let mut view = self.query.run(&handle)?;
        if !self.sort.is_empty() {
            view.sort(&handle, &self.sort)?;
        }
        Ok(view.rows().to_vec())
    }

    /// The most recently delivered background view, if any.
    pub fn delivered_rows(&self) -> Option<Vec<usize>> {
        self.target.view.lock().as_ref().map(|v| v.rows().to_vec())
    }

    /// Whether the background worker should keep the view fresh even while
    /// no callbacks are registered.
    pub fn set_wants_background_updates(&self, wants: bool) {
        self.target.wants_background_updates.store(wants, Ordering::Release);
    }

    /// Register a change callback. The callback receives one initial call
    /// (with an empty changeset) once the first background run delivers,
    /// and then one call per snapshot advance that changed the results.
    pub fn add_notification_callback(
        &self,
        callback: impl FnMut(&ChangeSet, Option<&Error>) + Send + 'static,
    ) -> Result<NotificationToken> {
        self.snapshot.verify_thread()?;
        let notifier = {
            let mut registration = self.notifier.lock();
            if registration.is_none() {
                let notifier = ResultsNotifier::new(
                    self.snapshot.coordinator(),
                    &self.snapshot,
                    self.query.clone(),
                    self.sort.clone(),
                    Arc::downgrade(&self.target),
                );
                let as_dyn: Arc<dyn CollectionNotifier> = notifier.clone();
                self.snapshot.coordinator().register_notifier(Arc::clone(&as_dyn));
                *registration = Some(Registration {
                    notifier,
                    _handle: NotifierHandle::new(as_dyn),
                });
            }
            Arc::clone(&registration.as_ref().expect("just registered").notifier)
        };
        let token = notifier.base().add_callback(Box::new(callback));
        Ok(NotificationToken::new(notifier, token))
    }
}

/// Aliveness marker for a [`List`]; the notifier retires once every strong
/// reference is gone.
pub(crate) struct ListTarget;

/// An ordered list-of-links collection which can deliver change
/// notifications.
pub struct List {
    snapshot: Arc<Snapshot>,
    table: usize,
    row: usize,
    col: usize,
    element_table: usize,
    target: Arc<ListTarget>,
    notifier: Mutex<Option<Registration<ListNotifier>>>,
}

impl List {
    pub fn new(snapshot: Arc<Snapshot>, table: usize, row: usize, col: usize) -> Result<List> {
        snapshot.verify_thread()?;
        let element_table = {
            let handle = snapshot.handle();
            match handle.table(table)?.column_kind(col)? {
                ColumnKind::LinkList { target } => target,
                _ => {
                    return Err(Error::Store(lodestone_store::StoreError::ColumnKindMismatch {
                        table,
                        col,
                    }))
                }
            }
        };
        Ok(List {
            snapshot,
            table,
            row,
            col,
            element_table,
            target: Arc::new(ListTarget),
            notifier: Mutex::new(None),
        })
    }

    /// The rows the list currently points at, at the snapshot's version.
    pub fn elements(&self) -> Result<Vec<usize>> {
        self.snapshot.verify_thread()?;
        let handle = self.snapshot.handle();
        Ok(handle.table(self.table)?.link_list(self.row, self.col)?.to_vec())
    }

    pub fn add_notification_callback(
        &self,
        callback: impl FnMut(&ChangeSet, Option<&Error>) + Send + 'static,
    ) -> Result<NotificationToken> {
        self.snapshot.verify_thread()?;
        let notifier = {
            let mut registration = self.notifier.lock();
            if registration.is_none() {
                let prev_size = self.elements()?.len();
                let notifier = ListNotifier::new(
                    self.snapshot.coordinator(),
                    &self.snapshot,
                    self.table,
                    self.row,
                    self.col,
                    self.element_table,
                    prev_size,
                    Arc::downgrade(&self.target),
                );
                let as_dyn: Arc<dyn CollectionNotifier> = notifier.clone();
                self.snapshot.coordinator().register_notifier(Arc::clone(&as_dyn));
                *registration = Some(Registration {
                    notifier,
                    _handle: NotifierHandle::new(as_dyn),
                });
            }
            Arc::clone(&registration.as_ref().expect("just registered").notifier)
        };
        let token = notifier.base().add_callback(Box::new(callback));
        Ok(NotificationToken::new(notifier, token))
    }
}
