use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use lodestone_store::{NullObserver, StoreHandle, Version};
use parking_lot::{Mutex, MutexGuard};

use crate::binding::{BindingContext, BindingObserver};
use crate::coordinator::Coordinator;
use crate::{Error, Result};

/// A per-thread view of a database.
///
/// A snapshot is pinned at a version and only moves forward explicitly: via
/// [`notify`](Self::notify) (driven by the event loop after the worker
/// wakes the thread), [`refresh`](Self::refresh), or by beginning a write
/// transaction. All operations except `wake` must happen on the owning
/// thread.
pub struct Snapshot {
    coordinator: Arc<Coordinator>,
    thread: ThreadId,
    handle: Mutex<StoreHandle>,
    waker: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    binding: Mutex<Option<Arc<dyn BindingContext>>>,
    // Guards against re-entrant delivery from inside a callback
    delivering: AtomicBool,
}

impl Snapshot {
    pub(crate) fn new(coordinator: Arc<Coordinator>, handle: StoreHandle, thread: ThreadId) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            coordinator,
            thread,
            handle: Mutex::new(handle),
            waker: Mutex::new(None),
            binding: Mutex::new(None),
            delivering: AtomicBool::new(false),
        })
    }

    /// Open (or fetch the calling thread's cached) snapshot for `config`.
    pub fn open(config: &crate::Config) -> Result<Arc<Snapshot>> {
        Coordinator::for_path(config)?.open_snapshot()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub(crate) fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn version(&self) -> Version {
        self.handle.lock().version()
    }

    /// Direct access to the underlying storage view. Must only be used from
    /// the owning thread; mutation requires an open write transaction.
    pub fn handle(&self) -> MutexGuard<'_, StoreHandle> {
        self.handle.lock()
    }

    pub(crate) fn verify_thread(&self) -> Result<()> {
        if std::thread::current().id() == self.thread {
            Ok(())
        } else {
            Err(Error::IncorrectThread)
        }
    }

    /// Install the event-loop wake hook. The hook is invoked from the
    /// worker thread whenever new notifier results are ready; its job is to
    /// schedule a call to [`notify`](Self::notify) on the owning thread.
    pub fn set_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *self.waker.lock() = Some(Arc::new(waker));
    }

    pub fn set_binding_context(&self, context: impl BindingContext + 'static) {
        *self.binding.lock() = Some(Arc::new(context));
    }

    pub(crate) fn wake(&self) {
        let waker = self.waker.lock().clone();
        if let Some(waker) = waker {
            waker();
        }
    }

    /// Advance to the version the background worker has computed notifiers
    /// for, deliver their results, and run due callbacks. No-op inside a
    /// write transaction or when re-entered from a callback.
    pub fn notify(&self) -> Result<()> {
        self.verify_thread()?;
        self.deliver_up_to(self.coordinator.ready_version())
    }

    /// Advance all the way to the latest commit. Notifiers whose results
    /// were computed for an older version simply redeliver on a later
    /// cycle. Returns whether the snapshot moved.
    pub fn refresh(&self) -> Result<bool> {
        self.verify_thread()?;
        let before = self.version();
        let latest = self.handle.lock().latest_version();
        self.deliver_up_to(latest)?;
        Ok(self.version() != before)
    }

    fn deliver_up_to(&self, target: Version) -> Result<()> {
        if self.delivering.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _reset = scopeguard::guard((), |()| self.delivering.store(false, Ordering::Release));

        let to_call = {
            let mut handle = self.handle.lock();
            if handle.in_write() {
                return Ok(());
            }
            if target > handle.version() {
                self.advance_observed(&mut handle, target)?;
            }
            self.coordinator.deliver_notifiers(self, &handle)
        };

        // Callbacks run with no lock held; they may open transactions,
        // add or remove callbacks, or drop collections
        for notifier in to_call {
            notifier.call_callbacks();
        }
        Ok(())
    }

    /// Begin a write transaction. Implicitly advances to the latest version
    /// first (reporting observed-row changes to the binding context).
    pub fn begin_write(&self) -> Result<()> {
        self.verify_thread()?;
        if self.coordinator.config().read_only {
            return Err(Error::ReadOnly);
        }
        let mut handle = self.handle.lock();
        match self.binding.lock().clone() {
            None => handle.begin_write(&mut NullObserver)?,
            Some(context) => {
                let mut observer = BindingObserver::new(context.observed_rows());
                let result = handle.begin_write(&mut observer);
                let (changed, invalidated) = observer.finish();
                if !changed.is_empty() || !invalidated.is_empty() {
                    context.will_change(&changed, &invalidated);
                    context.did_change(&changed, &invalidated);
                }
                result?;
            }
        }
        Ok(())
    }

    /// Commit the open write transaction and wake every interested party,
    /// local and cross-process.
    pub fn commit_write(&self) -> Result<Version> {
        self.verify_thread()?;
        let version = self.handle.lock().commit()?;
        self.coordinator.send_commit_notifications();
        if let Some(context) = self.binding.lock().clone() {
            context.did_change(&[], &[]);
        }
        Ok(version)
    }

    /// Abandon the open write transaction.
    pub fn cancel_write(&self) -> Result<()> {
        self.verify_thread()?;
        self.handle.lock().rollback()?;
        Ok(())
    }

    fn advance_observed(&self, handle: &mut StoreHandle, target: Version) -> Result<()> {
        match self.binding.lock().clone() {
            None => handle.advance(target, &mut NullObserver)?,
            Some(context) => {
                let mut observer = BindingObserver::new(context.observed_rows());
                let result = handle.advance(target, &mut observer);
                let (changed, invalidated) = observer.finish();
                if !changed.is_empty() || !invalidated.is_empty() {
                    context.will_change(&changed, &invalidated);
                    context.did_change(&changed, &invalidated);
                }
                result?;
            }
        }
        Ok(())
    }
}
