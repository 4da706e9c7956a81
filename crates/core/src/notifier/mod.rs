//! Per-collection notifier machinery.
//!
//! Lock order within a notifier: the concrete notifier's target lock, then
//! [`NotifierBase::pending`], then [`NotifierBase::callbacks`]. The
//! coordinator's registry lock is always taken before any of these. User
//! callbacks run with no lock held.

pub(crate) mod list;
pub(crate) mod results;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use lodestone_changeset::{ChangeBuilder, ChangeSet};
use lodestone_store::{StoreHandle, Version};
use parking_lot::Mutex;

use crate::coordinator::Coordinator;
use crate::txlog::TransactionChangeInfo;
use crate::{Error, Result};

/// A change notification callback. Receives the changeset (empty on the
/// initial call) or the error which terminated the notifier.
pub type ChangeCallback = Box<dyn FnMut(&ChangeSet, Option<&Error>) + Send>;

/// The sentinel cursor value meaning "no callback iteration in progress".
/// The cursor deliberately uses wrapping arithmetic: removing the entry the
/// cursor points at steps it back, possibly wrapping through this sentinel,
/// so that the next advance lands on the entry which shifted into place.
const NO_ITERATION: usize = usize::MAX;

struct Callback {
    /// Taken out of the slot while the callback is executing so the
    /// callback lock does not need to be held during user code.
    fun: Option<ChangeCallback>,
    token: u64,
    initial_delivered: bool,
    /// Removal requested while the callback was executing; honored when the
    /// invocation returns.
    removed_while_running: bool,
}

struct CallbackState {
    callbacks: Vec<Callback>,
    index: usize,
    changes_to_deliver: ChangeSet,
    error: Option<Arc<Error>>,
}

impl Default for CallbackState {
    fn default() -> Self {
        Self {
            callbacks: Vec::new(),
            index: NO_ITERATION,
            changes_to_deliver: ChangeSet::default(),
            error: None,
        }
    }
}

/// Worker-side output awaiting delivery: changes accumulated across one or
/// more runs (merged until a delivery flushes them), the version they were
/// computed at, and any latched error.
#[derive(Default)]
struct Pending {
    changes: ChangeBuilder,
    version: Option<Version>,
    error: Option<Arc<Error>>,
}

pub(crate) enum DeliverStatus {
    /// Nothing to do (wrong version, initial run incomplete).
    Skip,
    /// An error is latched; the bool is whether callbacks should run.
    ErrorLatched(bool),
    /// Changes were transferred to the callback state; the bool is whether
    /// callbacks should run.
    Delivered(bool),
}

/// State shared by every notifier kind: the callback registry, the
/// worker-to-delivery pending hand-off, and the identity of the delivery
/// thread.
pub(crate) struct NotifierBase {
    coordinator: Weak<Coordinator>,
    thread: ThreadId,
    pending: Mutex<Pending>,
    callbacks: Mutex<CallbackState>,
    // Callback-existence flag readable without the callback lock; may lag
    // one update behind and is only used to skip optional work
    have_callbacks: AtomicBool,
}

impl NotifierBase {
    pub(crate) fn new(coordinator: &Arc<Coordinator>, thread: ThreadId) -> Self {
        Self {
            coordinator: Arc::downgrade(coordinator),
            thread,
            pending: Mutex::new(Pending::default()),
            callbacks: Mutex::new(CallbackState::default()),
            have_callbacks: AtomicBool::new(false),
        }
    }

    pub(crate) fn thread(&self) -> ThreadId {
        self.thread
    }

    pub(crate) fn coordinator(&self) -> Option<Arc<Coordinator>> {
        self.coordinator.upgrade()
    }

    pub(crate) fn have_callbacks(&self) -> bool {
        self.have_callbacks.load(Ordering::Acquire)
    }

    pub(crate) fn add_callback(&self, fun: ChangeCallback) -> u64 {
        let (token, wake) = {
            let mut state = self.callbacks.lock();
            let token = state.callbacks.iter().map(|c| c.token + 1).max().unwrap_or(0);
            state.callbacks.push(Callback {
                fun: Some(fun),
                token,
                initial_delivered: false,
                removed_while_running: false,
            });
            self.have_callbacks.store(true, Ordering::Release);
            // No wake-up needed if a callback iteration is in progress: it
            // will pick the new callback up on its next cycle
            (token, state.index == NO_ITERATION)
        };
        if wake {
            if let Some(coordinator) = self.coordinator.upgrade() {
                coordinator.send_commit_notifications();
            }
        }
        token
    }

    pub(crate) fn remove_callback(&self, token: u64) {
        let removed;
        {
            let mut state = self.callbacks.lock();
            let Some(pos) = state.callbacks.iter().position(|c| c.token == token) else {
                return;
            };
            if state.callbacks[pos].fun.is_none() {
                // Currently executing: defer to the end of the invocation
                state.callbacks[pos].removed_while_running = true;
                return;
            }
            if state.index != NO_ITERATION && state.index >= pos {
                state.index = state.index.wrapping_sub(1);
            }
            removed = state.callbacks.remove(pos);
            self.have_callbacks
                .store(!state.callbacks.is_empty(), Ordering::Release);
        }
        // The callback itself is dropped outside the lock
        drop(removed);
    }

    /// Latch a worker-side error for exactly-once delivery.
    pub(crate) fn set_error(&self, error: Error) {
        self.pending.lock().error = Some(Arc::new(error));
    }

    /// Merge freshly computed changes into the pending accumulator.
    pub(crate) fn add_changes(&self, changes: ChangeBuilder) {
        self.pending.lock().changes.merge(changes);
    }

    pub(crate) fn set_pending_version(&self, version: Version) {
        self.pending.lock().version = Some(version);
    }

    pub(crate) fn clear_pending_changes(&self) {
        self.pending.lock().changes = ChangeBuilder::new();
    }

    /// The version- and error-checked part of delivery, shared by all
    /// notifier kinds. On success the accumulated changes move into the
    /// callback state, normalized so that modifications and insertions are
    /// disjoint (both in post-transition coordinates).
    pub(crate) fn deliver_common(&self, snapshot_version: Version, initial_run_complete: bool) -> DeliverStatus {
        let mut pending = self.pending.lock();

        if let Some(error) = pending.error.take() {
            self.callbacks.lock().error = Some(error);
            return DeliverStatus::ErrorLatched(self.have_callbacks());
        }

        if pending.version != Some(snapshot_version) || !initial_run_complete {
            return DeliverStatus::Skip;
        }

        let changes = std::mem::take(&mut pending.changes);
        drop(pending);

        // Rows which are genuinely new cannot be "modified"; rows which
        // merely moved keep their modification flag at the destination
        let mut changes: ChangeSet = changes.into();
        let mut inserted = changes.insertions.clone();
        for m in &changes.moves {
            inserted.remove(m.to);
        }
        changes.modifications.remove_set(&inserted);

        self.callbacks.lock().changes_to_deliver = changes;
        DeliverStatus::Delivered(self.have_callbacks())
    }

    /// Invoke every callback which is due: all of them when an error is
    /// latched or changes are pending, only the fresh ones otherwise (a
    /// newly added callback always receives one initial call).
    ///
    /// The callback lock is held only while the cursor advances, never
    /// during user code, so callbacks may add or remove callbacks
    /// re-entrantly.
    pub(crate) fn call_callbacks(&self) {
        while let Some((mut fun, token)) = self.next_callback() {
            let (changes, error) = {
                let state = self.callbacks.lock();
                (state.changes_to_deliver.clone(), state.error.clone())
            };
            fun(&changes, error.as_deref());

            let mut state = self.callbacks.lock();
            if let Some(pos) = state.callbacks.iter().position(|c| c.token == token) {
                if state.callbacks[pos].removed_while_running {
                    state.callbacks.remove(pos);
                    if state.index != NO_ITERATION && state.index >= pos {
                        state.index = state.index.wrapping_sub(1);
                    }
                    self.have_callbacks
                        .store(!state.callbacks.is_empty(), Ordering::Release);
                } else {
                    state.callbacks[pos].fun = Some(fun);
                }
            }
        }

        // After delivering an error nothing will ever be called again
        let purged: Vec<Callback> = {
            let mut state = self.callbacks.lock();
            if state.error.is_some() && !state.callbacks.is_empty() {
                self.have_callbacks.store(false, Ordering::Release);
                state.callbacks.drain(..).collect()
            } else {
                Vec::new()
            }
        };
        drop(purged);
    }

    fn next_callback(&self) -> Option<(ChangeCallback, u64)> {
        let mut state = self.callbacks.lock();
        state.index = state.index.wrapping_add(1);
        while state.index < state.callbacks.len() {
            let empty = state.changes_to_deliver.is_empty();
            let has_error = state.error.is_some();
            let index = state.index;
            let entry = &mut state.callbacks[index];
            if entry.fun.is_some() && (has_error || !entry.initial_delivered || !empty) {
                entry.initial_delivered = true;
                let fun = entry.fun.take().expect("checked above");
                return Some((fun, entry.token));
            }
            state.index += 1;
        }
        state.index = NO_ITERATION;
        None
    }
}

/// One registered notifier, as the coordinator and the delivery machinery
/// see it. Worker entry points run on the background thread; `deliver` and
/// `call_callbacks` run on the notifier's delivery thread.
pub(crate) trait CollectionNotifier: Send + Sync {
    fn base(&self) -> &NotifierBase;

    /// Target-side liveness. False once the target collection was dropped
    /// or the notifier was unregistered.
    fn is_alive(&self) -> bool;

    /// Sever the target backref. Safe from any thread; observed by the next
    /// worker run, which then skips this notifier.
    fn unregister(&self);

    /// First contact with the worker's store handle.
    fn attach(&self, handle: &StoreHandle);

    /// Release worker-side state, returning the notifier to its
    /// just-registered form. Called on the worker thread when it shuts
    /// down, so storage-derived state is dropped on the thread it was
    /// built on.
    fn detach(&self);

    /// Declare which tables (and lists) the next log parse must track.
    fn add_required_change_info(&self, info: &mut TransactionChangeInfo);

    /// Recompute against the worker handle's current version.
    fn run(&self, handle: &StoreHandle, info: &TransactionChangeInfo) -> Result<()>;

    /// Package the run's output for the delivery thread.
    fn prepare_handover(&self, handle: &StoreHandle);

    /// The log between two versions could not be parsed: drop incremental
    /// state and start over from the current version.
    fn reload(&self, handle: &StoreHandle);

    /// Import the handed-over state into the delivery thread's snapshot.
    /// Returns whether callbacks should run.
    fn deliver(&self, handle: &StoreHandle) -> bool;

    fn call_callbacks(&self) {
        self.base().call_callbacks();
    }
}

/// Owning handle to a registered notifier, held by its target collection.
/// Dropping it cancels the notifier from any thread.
pub(crate) struct NotifierHandle {
    notifier: Option<Arc<dyn CollectionNotifier>>,
}

impl NotifierHandle {
    pub(crate) fn new(notifier: Arc<dyn CollectionNotifier>) -> Self {
        Self {
            notifier: Some(notifier),
        }
    }
}

impl Drop for NotifierHandle {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.take() {
            notifier.unregister();
            if let Some(coordinator) = notifier.base().coordinator() {
                coordinator.unregister_notifier(&notifier);
            }
        }
    }
}

/// Keeps a notifier callback alive. Dropping the token removes the
/// callback; this is safe from any thread, and once the drop returns on the
/// notifier's delivery thread the callback will not run again.
pub struct NotificationToken {
    notifier: Mutex<Option<Arc<dyn CollectionNotifier>>>,
    token: u64,
}

impl NotificationToken {
    pub(crate) fn new(notifier: Arc<dyn CollectionNotifier>, token: u64) -> Self {
        Self {
            notifier: Mutex::new(Some(notifier)),
            token,
        }
    }
}

impl Drop for NotificationToken {
    fn drop(&mut self) {
        // Atomically detach first so a concurrent drop path never calls
        // remove_callback twice
        let notifier = self.notifier.lock().take();
        if let Some(notifier) = notifier {
            notifier.base().remove_callback(self.token);
        }
    }
}
