/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The canonical record store: the single mutable source of truth, plus
//! retained roots, subscriptions, and GC scheduling.
//!
//! `Store`'s methods take `&self`, not `&mut self` — mutation happens
//! through a shared `Rc<RefCell<Inner>>`, the same interior-mutability shape
//! the grounding workspace's test engines use to let callers hold a shared
//! `&Store` across a whole read/write/notify cycle without a borrow checker
//! fight. `Rc` rather than `Arc` because `Store` is explicitly
//! single-threaded (`!Sync`) by contract: disposables returned by
//! `retain`/`subscribe`/`hold_gc` need an owned handle onto the same state
//! that outlives the borrow of `&self` that created them, and a plain
//! reference can't do that safely.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use data_id::DataId;

use crate::check;
use crate::config::StoreConfig;
use crate::gc::{self, GcRoot, GcScheduler};
use crate::read::{self, Snapshot};
use crate::record::Record;
use crate::record_source::{InMemoryRecordSource, MutableRecordSource, RecordSource, RecordState};
use crate::selector::{NormalizationSelector, OperationDescriptor, ReaderSelector, Variables};

/// A handle returned by `retain`/`subscribe`/`hold_gc`. Disposing early via
/// [`Disposable::dispose`] runs the cleanup immediately; letting it drop
/// runs the same cleanup, so forgetting to call `dispose` explicitly still
/// can't leak a retained root or a live subscription past the handle's
/// lifetime.
pub struct Disposable {
    cleanup: Option<Box<dyn FnOnce()>>,
}

impl Disposable {
    pub(crate) fn new(cleanup: impl FnOnce() + 'static) -> Self {
        Disposable {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    pub fn dispose(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl Drop for Disposable {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

struct RetainedRoot {
    selector: Arc<NormalizationSelector>,
    root_id: DataId,
    variables: Variables,
}

struct Subscription {
    snapshot: Snapshot,
    callback: Box<dyn Fn(&Snapshot)>,
}

/// Everything mutable about a `Store`, behind one `RefCell` so disposables
/// can hold an `Rc` to it independent of any particular `&Store` borrow.
struct Inner {
    source: InMemoryRecordSource,
    updated_record_ids: HashSet<DataId>,
    roots: HashMap<u64, RetainedRoot>,
    next_root_index: u64,
    subscriptions: HashMap<u64, Subscription>,
    next_subscription_index: u64,
    gc_hold_count: usize,
    gc_pending: bool,
    /// Shadow copies of every record as of its last `publish()`, kept only
    /// when `debug_invariant_checks` is on. `lookup` diffs a record's live
    /// value against its shadow the first time each debug build sees it
    /// again, to catch a record having been mutated by something other
    /// than `publish`.
    shadows: HashMap<DataId, Record>,
}

/// The canonical store. Holds one `InMemoryRecordSource`; everything else
/// (the publish queue, readers, mutators) is a transient view over it.
pub struct Store {
    config: StoreConfig,
    inner: Rc<RefCell<Inner>>,
}

impl Store {
    pub fn new(source: InMemoryRecordSource, config: StoreConfig) -> Self {
        Store {
            config,
            inner: Rc::new(RefCell::new(Inner {
                source,
                updated_record_ids: HashSet::new(),
                roots: HashMap::new(),
                next_root_index: 0,
                subscriptions: HashMap::new(),
                next_subscription_index: 0,
                gc_hold_count: 0,
                gc_pending: false,
                shadows: HashMap::new(),
            })),
        }
    }

    /// A read-only view over the canonical source, for mutators that want
    /// to overlay writes on top of the store's current state.
    pub fn source(&self) -> std::cell::Ref<'_, InMemoryRecordSource> {
        std::cell::Ref::map(self.inner.borrow(), |inner| &inner.source)
    }

    /// Reads `selector` against the current canonical source, attributing
    /// any fragment pointers it produces to `owner`. In debug builds, with
    /// `debug_invariant_checks` on, also diffs every record the read
    /// touches against its shadow from the last `publish()` (see
    /// `StoreConfig::with_debug_invariant_checks`).
    pub fn lookup(&self, selector: Arc<ReaderSelector>, owner: Option<Arc<OperationDescriptor>>) -> Snapshot {
        log::trace!("lookup {:?} at {:?}", selector.node_name, selector.data_id);
        let inner = self.inner.borrow();
        let snapshot = read::read(&inner.source, selector, owner);
        if self.config.debug_invariant_checks {
            self.check_invariants(&inner, &snapshot);
        }
        snapshot
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self, inner: &Inner, snapshot: &Snapshot) {
        for id in &snapshot.seen_records {
            if let (Some(shadow), Some(live)) = (inner.shadows.get(id), inner.source.get_record(id)) {
                debug_assert_eq!(
                    *shadow, *live,
                    "record {:?} mutated outside of Store::publish since it was last published",
                    id
                );
            }
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_invariants(&self, _inner: &Inner, _snapshot: &Snapshot) {}

    /// Merges `patch` into the canonical source, recording every dataID
    /// whose value actually changed, and propagates any tombstones `patch`
    /// carries.
    pub fn publish(&self, patch: &InMemoryRecordSource) {
        let mut inner = self.inner.borrow_mut();
        let shadow_checks = self.config.debug_invariant_checks;

        for (id, next) in patch.iter() {
            match inner.source.get(id) {
                RecordState::Existent(prev) => {
                    let (merged, changed) = prev.merge(next);
                    if changed {
                        inner.source.set(id.clone(), Arc::new(merged));
                        inner.updated_record_ids.insert(id.clone());
                    }
                }
                _ => {
                    inner.source.set(id.clone(), Arc::clone(next));
                    inner.updated_record_ids.insert(id.clone());
                }
            }
            if shadow_checks {
                if let Some(record) = inner.source.get_record(id) {
                    inner.shadows.insert(id.clone(), (*record).clone());
                }
            }
        }

        for id in patch.deleted_ids() {
            if !matches!(inner.source.get(id), RecordState::NonExistent) {
                inner.source.delete(id);
                inner.updated_record_ids.insert(id.clone());
                inner.shadows.remove(id);
            }
        }
    }

    /// Re-reads every subscription whose previous `seen_records` overlaps
    /// the set of ids changed since the last `notify`, recycles unchanged
    /// data, and fires callbacks whose data actually moved. Returns the
    /// owners of every snapshot that fired, then clears the updated set.
    ///
    /// Callbacks run with the store's state already updated but still
    /// borrowed; they must not call back into this `Store` synchronously.
    pub fn notify(&self) -> Vec<Arc<OperationDescriptor>> {
        let updated = {
            let mut inner = self.inner.borrow_mut();
            std::mem::take(&mut inner.updated_record_ids)
        };

        let mut fired_owners = Vec::new();
        if updated.is_empty() {
            return fired_owners;
        }

        type Candidate = (u64, Snapshot);
        let candidates: Vec<Candidate> = {
            let inner = self.inner.borrow();
            inner
                .subscriptions
                .iter()
                .filter(|(_, sub)| has_overlapping_ids(&sub.snapshot, &updated))
                .map(|(id, sub)| (*id, sub.snapshot.clone()))
                .collect()
        };

        for (id, old_snapshot) in candidates {
            let new_snapshot = {
                let inner = self.inner.borrow();
                read::read(&inner.source, Arc::clone(&old_snapshot.selector), old_snapshot.owner.clone())
            };
            let new_snapshot = read::recycle_snapshot(&old_snapshot, new_snapshot);

            let changed = match (&old_snapshot.data, &new_snapshot.data) {
                (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
                (None, None) => false,
                _ => true,
            };
            if !changed {
                continue;
            }

            if let Some(owner) = new_snapshot.owner.clone() {
                fired_owners.push(owner);
            }

            let mut inner = self.inner.borrow_mut();
            if let Some(sub) = inner.subscriptions.get_mut(&id) {
                (sub.callback)(&new_snapshot);
                sub.snapshot = new_snapshot;
            }
        }

        fired_owners
    }

    /// Subscribes to `snapshot`, invoking `callback` on every future
    /// `notify` whose changed ids overlap what this snapshot read.
    /// Disposing unregisters it.
    pub fn subscribe(&self, snapshot: Snapshot, callback: Box<dyn Fn(&Snapshot)>) -> Disposable {
        let mut inner = self.inner.borrow_mut();
        let index = inner.next_subscription_index;
        inner.next_subscription_index += 1;
        inner.subscriptions.insert(index, Subscription { snapshot, callback });
        drop(inner);

        let inner_rc = Rc::clone(&self.inner);
        Disposable::new(move || {
            inner_rc.borrow_mut().subscriptions.remove(&index);
        })
    }

    /// Retains `selector`'s root as a GC marking root; disposing removes it
    /// and schedules a GC pass.
    pub fn retain(&self, selector: Arc<NormalizationSelector>, root_id: DataId, variables: Variables) -> Disposable {
        let mut inner = self.inner.borrow_mut();
        let index = inner.next_root_index;
        inner.next_root_index += 1;
        inner.roots.insert(index, RetainedRoot { selector, root_id, variables });
        drop(inner);

        let inner_rc = Rc::clone(&self.inner);
        let scheduler = Arc::clone(&self.config.gc_scheduler);
        Disposable::new(move || {
            inner_rc.borrow_mut().roots.remove(&index);
            schedule_gc(&inner_rc, &scheduler);
        })
    }

    /// Defers any GC pass that would otherwise run while the returned
    /// handle is alive. If a release happened during the hold, disposing it
    /// runs the deferred pass.
    pub fn hold_gc(&self) -> Disposable {
        self.inner.borrow_mut().gc_hold_count += 1;

        let inner_rc = Rc::clone(&self.inner);
        let scheduler = Arc::clone(&self.config.gc_scheduler);
        Disposable::new(move || {
            let should_run = {
                let mut inner = inner_rc.borrow_mut();
                inner.gc_hold_count -= 1;
                inner.gc_hold_count == 0 && inner.gc_pending
            };
            if should_run {
                run_gc(&inner_rc, &scheduler);
            }
        })
    }

    pub fn check(&self, selector: &NormalizationSelector, root_id: &DataId, variables: &Variables) -> bool {
        let inner = self.inner.borrow();
        check::check(&inner.source, root_id, &selector.selections, variables)
    }
}

/// Runs (or, while held, defers) one GC pass.
fn schedule_gc(inner: &Rc<RefCell<Inner>>, scheduler: &Arc<dyn GcScheduler>) {
    let held = inner.borrow().gc_hold_count > 0;
    if held {
        inner.borrow_mut().gc_pending = true;
        return;
    }
    run_gc(inner, scheduler);
}

/// Hands the current roots to the scheduler for an (immediate or deferred)
/// mark-sweep pass over the shared source.
fn run_gc(inner: &Rc<RefCell<Inner>>, scheduler: &Arc<dyn GcScheduler>) {
    inner.borrow_mut().gc_pending = false;
    let roots: Vec<GcRoot> = inner
        .borrow()
        .roots
        .values()
        .map(|r| GcRoot {
            root_id: r.root_id.clone(),
            selections: Arc::clone(&r.selector.selections),
            variables: r.variables.clone(),
        })
        .collect();

    let inner_rc = Rc::clone(inner);
    scheduler.schedule(Box::new(move || {
        gc::sweep(&mut inner_rc.borrow_mut().source, &roots);
    }));
}

/// Intersection test between a snapshot's seen-records and the set of ids
/// changed since the last notify.
fn has_overlapping_ids(snapshot: &Snapshot, updated: &HashSet<DataId>) -> bool {
    snapshot.seen_records.iter().any(|id| updated.contains(id))
}
