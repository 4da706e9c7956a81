use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use lodestone_store::{SharedStore, StoreError, StoreHandle, Version};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::commit_helper::ExternalCommitHelper;
use crate::notifier::CollectionNotifier;
use crate::snapshot::Snapshot;
use crate::txlog::{ChangeInfoParser, TransactionChangeInfo};
use crate::{Config, Error, Result};

static COORDINATORS: Lazy<Mutex<FxHashMap<PathBuf, Weak<Coordinator>>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

enum WorkerMsg {
    Changed,
    Shutdown,
}

#[derive(Default)]
struct Registry {
    snapshots: Vec<Weak<Snapshot>>,
    notifiers: Vec<Arc<dyn CollectionNotifier>>,
    // Registered but not yet seen by the worker
    new_notifiers: Vec<Arc<dyn CollectionNotifier>>,
}

/// The per-database-file singleton: owns the shared store, the notifier
/// registry, the per-thread snapshot cache, the background worker, and the
/// cross-process commit channel.
///
/// Kept alive by shared ownership from every open [`Snapshot`]; the global
/// path map only holds weak references.
pub struct Coordinator {
    config: Config,
    store: Arc<SharedStore>,
    // Lock order: this registry lock is always taken before any
    // notifier-internal lock, never after
    registry: Mutex<Registry>,
    worker_tx: Sender<WorkerMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
    helper: Option<ExternalCommitHelper>,
    // The version the worker last computed notifiers against; delivery
    // threads advance to it on notify()
    ready_version: Mutex<Version>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Get the coordinator for the given config's path, creating it if
    /// necessary. An existing coordinator rejects configurations which
    /// disagree with the one it was opened with.
    pub fn for_path(config: &Config) -> Result<Arc<Coordinator>> {
        let mut map = COORDINATORS.lock();
        map.retain(|_, weak| weak.strong_count() > 0);

        if let Some(existing) = map.get(&config.path).and_then(Weak::upgrade) {
            existing.verify_config(config)?;
            return Ok(existing);
        }

        let coordinator = Coordinator::create(config.clone())?;
        map.insert(config.path.clone(), Arc::downgrade(&coordinator));
        Ok(coordinator)
    }

    /// Drop all cached coordinator references. Test support only: databases
    /// still open elsewhere keep working, but new opens start fresh.
    pub fn clear_cache() {
        COORDINATORS.lock().clear();
    }

    fn create(config: Config) -> Result<Arc<Coordinator>> {
        let store = SharedStore::new(config.schema.clone());
        let (worker_tx, worker_rx) = crossbeam_channel::unbounded();

        // A read-only open never commits, so it does not need the channel;
        // in write mode a channel failure makes the database unusable
        let helper = if config.read_only {
            None
        } else {
            let tx = worker_tx.clone();
            Some(ExternalCommitHelper::new(
                &config.path,
                Box::new(move || {
                    let _ = tx.send(WorkerMsg::Changed);
                }),
            )?)
        };

        let coordinator = Arc::new(Coordinator {
            config,
            store,
            registry: Mutex::new(Registry::default()),
            worker_tx,
            worker: Mutex::new(None),
            helper,
            ready_version: Mutex::new(Version(0)),
        });

        let worker = {
            let weak = Arc::downgrade(&coordinator);
            std::thread::Builder::new()
                .name("lodestone-worker".into())
                .spawn(move || worker_loop(&weak, &worker_rx))?
        };
        *coordinator.worker.lock() = Some(worker);

        Ok(coordinator)
    }

    fn verify_config(&self, config: &Config) -> Result<()> {
        let mismatch = |property| Error::ConfigMismatch {
            path: self.config.path.clone(),
            property,
        };
        if self.config.read_only != config.read_only {
            return Err(mismatch("read_only setting"));
        }
        if self.config.in_memory != config.in_memory {
            return Err(mismatch("in_memory setting"));
        }
        if self.config.schema_version != config.schema_version {
            return Err(mismatch("schema version"));
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    /// The thread-local snapshot for the calling thread, opening one on
    /// first use.
    pub fn open_snapshot(self: &Arc<Self>) -> Result<Arc<Snapshot>> {
        let thread = std::thread::current().id();
        let mut registry = self.registry.lock();
        registry.snapshots.retain(|weak| weak.strong_count() > 0);
        for weak in &registry.snapshots {
            if let Some(snapshot) = weak.upgrade() {
                if snapshot.thread() == thread {
                    return Ok(snapshot);
                }
            }
        }
        let snapshot = Snapshot::new(Arc::clone(self), self.store.handle(), thread);
        registry.snapshots.push(Arc::downgrade(&snapshot));
        Ok(snapshot)
    }

    /// Asynchronously wake the worker in every process (including this one)
    /// attached to this database.
    pub fn send_commit_notifications(&self) {
        match &self.helper {
            Some(helper) => helper.notify_others(),
            None => {
                let _ = self.worker_tx.send(WorkerMsg::Changed);
            }
        }
    }

    pub(crate) fn ready_version(&self) -> Version {
        *self.ready_version.lock()
    }

    pub(crate) fn register_notifier(&self, notifier: Arc<dyn CollectionNotifier>) {
        let mut registry = self.registry.lock();
        registry.notifiers.push(Arc::clone(&notifier));
        registry.new_notifiers.push(notifier);
    }

    pub(crate) fn unregister_notifier(&self, notifier: &Arc<dyn CollectionNotifier>) {
        let mut registry = self.registry.lock();
        registry.notifiers.retain(|n| !Arc::ptr_eq(n, notifier));
        registry.new_notifiers.retain(|n| !Arc::ptr_eq(n, notifier));
    }

    /// One background computation pass: catch up new notifiers, parse the
    /// log from the pinned version to the newest commit, run every notifier
    /// and package its results, then wake the delivery threads.
    pub(crate) fn run_synced_notifiers(&self, handle: &mut StoreHandle) {
        let (new_notifiers, notifiers) = {
            let mut registry = self.registry.lock();
            registry.notifiers.retain(|n| n.is_alive());
            registry.new_notifiers.retain(|n| n.is_alive());
            (
                std::mem::take(&mut registry.new_notifiers),
                registry.notifiers.clone(),
            )
        };

        for notifier in &new_notifiers {
            notifier.attach(handle);
        }

        let mut info = TransactionChangeInfo::default();
        for notifier in &notifiers {
            if notifier.is_alive() {
                notifier.add_required_change_info(&mut info);
            }
        }

        let target = handle.latest_version();
        if target > handle.version() {
            let mut parser = ChangeInfoParser::new(&mut info);
            match handle.advance(target, &mut parser) {
                Ok(()) => {}
                Err(StoreError::UnsupportedLogOp) => {
                    // Schema changed under us: incremental change tracking
                    // is meaningless, so every notifier recomputes from
                    // scratch at the new version
                    tracing::warn!(
                        "unsupported transaction log instruction; forcing full notifier recomputation"
                    );
                    info.reset_parsed();
                    for notifier in &notifiers {
                        notifier.reload(handle);
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "background advance failed");
                    return;
                }
            }
        }

        for notifier in &notifiers {
            if !notifier.is_alive() {
                continue;
            }
            if let Err(err) = notifier.run(handle, &info) {
                tracing::warn!(%err, "background notifier run failed");
                notifier.base().set_error(err);
            }
            notifier.prepare_handover(handle);
        }

        *self.ready_version.lock() = target;
        self.wake_delivery_threads();
    }

    fn wake_delivery_threads(&self) {
        let snapshots: Vec<Arc<Snapshot>> = {
            let mut registry = self.registry.lock();
            registry.snapshots.retain(|weak| weak.strong_count() > 0);
            registry.snapshots.iter().filter_map(Weak::upgrade).collect()
        };
        // Wakers are app code; never invoke them under the registry lock
        for snapshot in snapshots {
            snapshot.wake();
        }
    }

    /// Deliver every computed notifier bound to `snapshot`'s thread.
    /// Returns the notifiers whose callbacks should now run.
    pub(crate) fn deliver_notifiers(
        &self,
        snapshot: &Snapshot,
        handle: &StoreHandle,
    ) -> Vec<Arc<dyn CollectionNotifier>> {
        let candidates: Vec<Arc<dyn CollectionNotifier>> = {
            let registry = self.registry.lock();
            registry
                .notifiers
                .iter()
                .filter(|n| n.base().thread() == snapshot.thread())
                .cloned()
                .collect()
        };
        candidates.into_iter().filter(|n| n.deliver(handle)).collect()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let _ = self.worker_tx.send(WorkerMsg::Shutdown);
        if let Some(worker) = self.worker.get_mut().take() {
            // The last reference can be the one the worker itself upgraded;
            // it cannot join itself, and exits via the channel disconnect
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn worker_loop(coordinator: &Weak<Coordinator>, rx: &Receiver<WorkerMsg>) {
    let mut handle: Option<StoreHandle> = None;
    'outer: while let Ok(first) = rx.recv() {
        // Coalesce bursts of wake-ups into one pass
        let mut msg = first;
        loop {
            match msg {
                WorkerMsg::Shutdown => break 'outer,
                WorkerMsg::Changed => {}
            }
            match rx.try_recv() {
                Ok(next) => msg = next,
                Err(_) => break,
            }
        }

        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        let handle = handle.get_or_insert_with(|| coordinator.store().handle());
        coordinator.run_synced_notifiers(handle);
    }

    // Storage-derived notifier state is dropped here, on the thread that
    // built it
    if let Some(coordinator) = coordinator.upgrade() {
        let notifiers = coordinator.registry.lock().notifiers.clone();
        for notifier in notifiers {
            notifier.detach();
        }
    }
}
