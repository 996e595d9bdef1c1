/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Coordinates atomicity across optimistic and authoritative writes.
//!
//! Nothing reaches the canonical `Store` until `run()` is called: every
//! `commit_*`/`apply_update`/`revert_*` call only queues work. `run()` is
//! the single point where all of it is materialized, in the fixed order
//! documented on [`PublishQueue::run`], and published.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use data_id::DataId;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::gc::ImmediateScheduler;
use crate::handle::{HandleFieldPayload, HandlerRegistry};
use crate::mutator::{RecordSourceMutator, RecordSourceProxy};
use crate::normalize::{DefaultGetDataId, GetDataId, NoopOperationLoader, Normalizer, NormalizerOptions, OperationLoader};
use crate::read::{self, Snapshot};
use crate::record_source::InMemoryRecordSource;
use crate::selector::{OperationDescriptor, ReaderSelector};
use crate::store::{Disposable, Store};

/// The output of normalizing a response ahead of time: what `run()` will
/// overlay onto the store, plus any client-field handles it needs to run.
#[derive(Debug, Clone, Default)]
pub struct NormalizedPayload {
    pub source: InMemoryRecordSource,
    pub field_payloads: Vec<HandleFieldPayload>,
}

/// Runs after a payload or optimistic update has been applied to a
/// transaction's sink, given the freshly re-read data for its own
/// selector. Mirrors an updater function closing over a selector proxy in
/// the grounding engine's JS updater callback shape.
pub trait SelectorUpdater {
    fn update(&self, mutator: &mut RecordSourceMutator<'_>, snapshot: &Snapshot) -> Result<()>;
}

/// A store updater with no associated operation: just a callback over a
/// mutator, used for both `commit_update` and the `StoreUpdater` optimistic
/// variant.
pub trait StoreUpdater {
    fn update(&self, mutator: &mut RecordSourceMutator<'_>) -> Result<()>;
}

/// One applied-or-pending optimistic change. Payload updates carry a raw
/// response and are renormalized from scratch on every rebase (the sink
/// they land in is thrown away and rebuilt each `run()`), since the base
/// they overlay may have shifted.
pub enum OptimisticUpdate {
    Payload {
        operation: Arc<OperationDescriptor>,
        response: JsonValue,
        updater: Option<Box<dyn SelectorUpdater>>,
    },
    StoreUpdater(Box<dyn StoreUpdater>),
    Source {
        source: InMemoryRecordSource,
        field_payloads: Vec<HandleFieldPayload>,
    },
}

/// Identity comparison for duplicate detection, not a general `PartialEq`:
/// `StoreUpdater` has no meaningful content equality, so two updaters are
/// "the same update" only if they're the same boxed closure/object; the
/// other two variants compare by content since they're plain data.
fn updates_match(a: &OptimisticUpdate, b: &OptimisticUpdate) -> bool {
    match (a, b) {
        (OptimisticUpdate::StoreUpdater(a), OptimisticUpdate::StoreUpdater(b)) => std::ptr::eq(&**a, &**b),
        (
            OptimisticUpdate::Payload {
                operation: op_a,
                response: r_a,
                ..
            },
            OptimisticUpdate::Payload {
                operation: op_b,
                response: r_b,
                ..
            },
        ) => Arc::ptr_eq(op_a, op_b) && r_a == r_b,
        (
            OptimisticUpdate::Source {
                source: s_a,
                field_payloads: f_a,
            },
            OptimisticUpdate::Source {
                source: s_b,
                field_payloads: f_b,
            },
        ) => s_a == s_b && f_a == f_b,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptimisticUpdateId(u64);

/// An insertion-ordered id → update map (the "applied optimistic updates"
/// set from the run() protocol). A plain `HashMap` would let rebase order
/// depend on hash iteration order, which would make `@match`/overlapping
/// optimistic writes on the same field nondeterministic.
#[derive(Default)]
struct OrderedUpdates {
    order: Vec<OptimisticUpdateId>,
    by_id: HashMap<OptimisticUpdateId, OptimisticUpdate>,
}

impl OrderedUpdates {
    fn insert(&mut self, id: OptimisticUpdateId, update: OptimisticUpdate) {
        self.order.push(id);
        self.by_id.insert(id, update);
    }

    fn remove(&mut self, id: OptimisticUpdateId) -> Option<OptimisticUpdate> {
        self.order.retain(|existing| *existing != id);
        self.by_id.remove(&id)
    }

    fn drain_in_order(&mut self) -> Vec<(OptimisticUpdateId, OptimisticUpdate)> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| self.by_id.remove(&id).map(|update| (id, update)))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

enum PendingData {
    Payload {
        normalized: NormalizedPayload,
        reader_selector: Option<Arc<ReaderSelector>>,
        owner: Option<Arc<OperationDescriptor>>,
        updater: Option<Box<dyn SelectorUpdater>>,
    },
    Source(InMemoryRecordSource),
}

/// Guards against reentrant `run()` calls (e.g. a subscription callback
/// fired by `notify()` calling back into `run()`), which is a programmer
/// error per the crate's error-handling design.
struct ReentrancyGuard<'a> {
    running: &'a Cell<bool>,
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        self.running.set(false);
    }
}

pub struct PublishQueue {
    store: Rc<Store>,
    handlers: Rc<HandlerRegistry>,
    get_data_id: Rc<dyn GetDataId>,
    operation_loader: Rc<dyn OperationLoader>,

    backup: InMemoryRecordSource,
    pending_data: Vec<PendingData>,
    pending_updaters: Vec<Box<dyn StoreUpdater>>,
    pending_optimistic_updates: Vec<(OptimisticUpdateId, OptimisticUpdate)>,
    applied_optimistic_updates: OrderedUpdates,
    pending_backup_rebase: bool,
    gc_hold: Option<Disposable>,
    next_update_id: u64,
    running: Cell<bool>,
}

impl PublishQueue {
    pub fn new(store: Rc<Store>, handlers: Rc<HandlerRegistry>) -> Self {
        PublishQueue {
            store,
            handlers,
            get_data_id: Rc::new(DefaultGetDataId),
            operation_loader: Rc::new(NoopOperationLoader),
            backup: InMemoryRecordSource::new(),
            pending_data: Vec::new(),
            pending_updaters: Vec::new(),
            pending_optimistic_updates: Vec::new(),
            applied_optimistic_updates: OrderedUpdates::default(),
            pending_backup_rebase: false,
            gc_hold: None,
            next_update_id: 0,
            running: Cell::new(false),
        }
    }

    pub fn with_get_data_id(mut self, get_data_id: Rc<dyn GetDataId>) -> Self {
        self.get_data_id = get_data_id;
        self
    }

    pub fn with_operation_loader(mut self, operation_loader: Rc<dyn OperationLoader>) -> Self {
        self.operation_loader = operation_loader;
        self
    }

    /// Queues an already-normalized authoritative payload. `reader_selector`
    /// and `owner` are only needed when `updater` is supplied (they let
    /// `run()` hand the updater a freshly-read snapshot of its own data).
    pub fn commit_payload(
        &mut self,
        reader_selector: Option<Arc<ReaderSelector>>,
        owner: Option<Arc<OperationDescriptor>>,
        normalized: NormalizedPayload,
        updater: Option<Box<dyn SelectorUpdater>>,
    ) {
        self.pending_backup_rebase = true;
        self.pending_data.push(PendingData::Payload {
            normalized,
            reader_selector,
            owner,
            updater,
        });
    }

    pub fn commit_source(&mut self, source: InMemoryRecordSource) {
        self.pending_backup_rebase = true;
        self.pending_data.push(PendingData::Source(source));
    }

    pub fn commit_update(&mut self, updater: Box<dyn StoreUpdater>) {
        self.pending_backup_rebase = true;
        self.pending_updaters.push(updater);
    }

    /// Queues an optimistic update. The returned id can be used with
    /// `revert_update` to later undo exactly this update, whether or not it
    /// has been applied by a `run()` yet.
    ///
    /// Rejects the update if it is already tracked, either still pending or
    /// already applied by a prior `run()` — mirrors real Relay's invariant
    /// on `_appliedOptimisticUpdates.has(updater)`, which exists so that a
    /// caller that fires the same update twice (e.g. a retried mutation)
    /// doesn't end up with it applied twice over.
    pub fn apply_update(&mut self, update: OptimisticUpdate) -> Result<OptimisticUpdateId> {
        if self.is_duplicate(&update) {
            return Err(Error::InvalidOptimisticUpdate(
                "this optimistic update is already tracked as pending or applied".into(),
            ));
        }
        let id = OptimisticUpdateId(self.next_update_id);
        self.next_update_id += 1;
        self.pending_optimistic_updates.push((id, update));
        Ok(id)
    }

    fn is_duplicate(&self, update: &OptimisticUpdate) -> bool {
        self.pending_optimistic_updates
            .iter()
            .map(|(_, existing)| existing)
            .chain(self.applied_optimistic_updates.by_id.values())
            .any(|existing| updates_match(existing, update))
    }

    /// Reverts `id`. If it was only pending (never applied by a `run()`),
    /// it is simply dropped. If it was already applied, this marks a
    /// rebase so the next `run()` rebuilds the optimistic overlay without it.
    pub fn revert_update(&mut self, id: OptimisticUpdateId) {
        if let Some(pos) = self.pending_optimistic_updates.iter().position(|(pending_id, _)| *pending_id == id) {
            self.pending_optimistic_updates.remove(pos);
            return;
        }
        if self.applied_optimistic_updates.remove(id).is_some() {
            self.pending_backup_rebase = true;
        }
    }

    pub fn revert_all(&mut self) {
        self.pending_optimistic_updates.clear();
        self.applied_optimistic_updates = OrderedUpdates::default();
        self.pending_backup_rebase = true;
    }

    /// Materializes every queued operation onto the store, in order:
    /// undo, apply authoritative writes, apply client updaters, rebase
    /// optimistic updates, reconcile the GC hold, notify. Returns the
    /// owners of every subscription that fired.
    pub fn run(&mut self) -> Result<Vec<Arc<OperationDescriptor>>> {
        if self.running.get() {
            panic!("Bug: PublishQueue::run called reentrantly");
        }
        self.running.set(true);
        let _guard = ReentrancyGuard { running: &self.running };

        self.undo();
        self.apply_pending_data()?;
        self.apply_pending_updaters()?;
        self.rebase_optimistic_updates()?;
        self.finalize_gc_hold();

        Ok(self.store.notify())
    }

    fn undo(&mut self) {
        if self.pending_backup_rebase && !self.backup.is_empty() {
            self.store.publish(&self.backup);
            self.backup = InMemoryRecordSource::new();
        }
    }

    fn apply_pending_data(&mut self) -> Result<()> {
        for entry in std::mem::take(&mut self.pending_data) {
            match entry {
                PendingData::Source(source) => self.store.publish(&source),
                PendingData::Payload {
                    normalized,
                    reader_selector,
                    owner,
                    updater,
                } => {
                    let sink = {
                        let base = self.store.source();
                        let mut mutator = RecordSourceMutator::from_sink(&*base, normalized.source, false);
                        for payload in &normalized.field_payloads {
                            self.handlers.dispatch(&mut mutator, payload)?;
                        }
                        if let (Some(updater), Some(selector)) = (updater, reader_selector) {
                            let snapshot = {
                                let proxy = RecordSourceProxy::new(&*base, &mutator.sink);
                                read::read(&proxy, selector, owner)
                            };
                            if let Err(err) = updater.update(&mut mutator, &snapshot) {
                                log::warn!("payload updater failed, dropping its writes: {}", err);
                            }
                        }
                        mutator.into_sink_and_backup().0
                    };
                    self.store.publish(&sink);
                }
            }
        }
        Ok(())
    }

    fn apply_pending_updaters(&mut self) -> Result<()> {
        let updaters = std::mem::take(&mut self.pending_updaters);
        if updaters.is_empty() {
            return Ok(());
        }
        let sink = {
            let base = self.store.source();
            let mut mutator = RecordSourceMutator::new(&*base, false);
            for updater in &updaters {
                if let Err(err) = updater.update(&mut mutator) {
                    log::warn!("store updater failed, dropping its writes: {}", err);
                }
            }
            mutator.into_sink_and_backup().0
        };
        self.store.publish(&sink);
        Ok(())
    }

    fn rebase_optimistic_updates(&mut self) -> Result<()> {
        let new_updates = std::mem::take(&mut self.pending_optimistic_updates);
        let rebasing = self.pending_backup_rebase && !self.applied_optimistic_updates.is_empty();
        if !rebasing && new_updates.is_empty() {
            return Ok(());
        }

        let still_applied = self.applied_optimistic_updates.drain_in_order();

        let (sink, backup) = {
            let base = self.store.source();
            let mut mutator = RecordSourceMutator::new(&*base, true);

            for (id, update) in still_applied.into_iter().chain(new_updates.into_iter()) {
                self.apply_one_optimistic_update(&mut mutator, &update)?;
                self.applied_optimistic_updates.insert(id, update);
            }
            mutator.into_sink_and_backup()
        };
        self.store.publish(&sink);
        self.backup = backup.unwrap_or_default();
        Ok(())
    }

    fn apply_one_optimistic_update(&self, mutator: &mut RecordSourceMutator<'_>, update: &OptimisticUpdate) -> Result<()> {
        match update {
            OptimisticUpdate::StoreUpdater(updater) => {
                if let Err(err) = updater.update(mutator) {
                    log::warn!("optimistic store updater failed, dropping its writes: {}", err);
                }
            }
            OptimisticUpdate::Source { source, field_payloads } => {
                for (id, record) in source.iter() {
                    mutator.set((*id).clone(), (**record).clone());
                }
                for payload in field_payloads {
                    self.handlers.dispatch(mutator, payload)?;
                }
            }
            OptimisticUpdate::Payload {
                operation,
                response,
                updater,
            } => {
                let variables = &operation.variables;
                let options = NormalizerOptions {
                    variables,
                    get_data_id: &*self.get_data_id,
                    operation_loader: &*self.operation_loader,
                };
                let root_id = operation.root_id.clone();
                let selections = operation.normalization_selector.selections.clone();
                let normalizer = Normalizer::new(mutator, &options);
                let field_payloads = normalizer.normalize(&root_id, &selections, response)?;
                for payload in &field_payloads {
                    self.handlers.dispatch(mutator, payload)?;
                }
                if let Some(updater) = updater {
                    let snapshot = {
                        let proxy = RecordSourceProxy::new(mutator.base(), &mutator.sink);
                        read::read(&proxy, Arc::clone(&operation.reader_selector), Some(Arc::clone(operation)))
                    };
                    if let Err(err) = updater.update(mutator, &snapshot) {
                        log::warn!("optimistic payload updater failed, dropping its writes: {}", err);
                    }
                }
            }
        }
        Ok(())
    }

    fn finalize_gc_hold(&mut self) {
        self.pending_backup_rebase = false;
        let has_applied = !self.applied_optimistic_updates.is_empty();
        match (has_applied, self.gc_hold.is_some()) {
            (true, false) => self.gc_hold = Some(self.store.hold_gc()),
            (false, true) => {
                if let Some(hold) = self.gc_hold.take() {
                    hold.dispose();
                }
            }
            _ => {}
        }
    }
}

/// A `StoreUpdater`/`SelectorUpdater` implementation that simply does
/// nothing; useful in tests and as a default when an embedder has no
/// follow-up work to run after a commit.
pub struct NoopUpdater;
impl StoreUpdater for NoopUpdater {
    fn update(&self, _mutator: &mut RecordSourceMutator<'_>) -> Result<()> {
        Ok(())
    }
}
impl SelectorUpdater for NoopUpdater {
    fn update(&self, _mutator: &mut RecordSourceMutator<'_>, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::gc::ManualScheduler;
    use crate::record::{FieldValue, Record};
    use crate::selector::{NormalizationSelection, NormalizationSelector, Variables};
    use std::collections::BTreeMap;

    fn store() -> Rc<Store> {
        Rc::new(Store::new(InMemoryRecordSource::new(), StoreConfig::new()))
    }

    fn user_operation(root_id: DataId) -> Arc<OperationDescriptor> {
        let selections = Arc::new(vec![NormalizationSelection::ScalarField {
            field_name: "name".into(),
            response_key: "name".into(),
            args: vec![],
        }]);
        Arc::new(OperationDescriptor {
            name: "UserQuery".into(),
            variables: Variables::new(),
            root_id: root_id.clone(),
            reader_selector: Arc::new(ReaderSelector {
                node_name: "UserQuery".into(),
                data_id: root_id.clone(),
                variables: Variables::new(),
                selections: Arc::new(vec![crate::selector::ReaderSelection::ScalarField {
                    field_name: "name".into(),
                    args: vec![],
                    response_key: "name".into(),
                }]),
            }),
            normalization_selector: Arc::new(NormalizationSelector {
                operation_name: "UserQuery".into(),
                selections,
            }),
        })
    }

    struct CreateUser {
        id: DataId,
        name: &'static str,
    }
    impl StoreUpdater for CreateUser {
        fn update(&self, mutator: &mut RecordSourceMutator<'_>) -> Result<()> {
            let mut record = Record::with_typename(self.id.clone(), "User");
            record.set("name", FieldValue::Scalar(self.name.into()));
            mutator.set(self.id.clone(), record);
            Ok(())
        }
    }

    #[test]
    fn test_optimistic_then_authoritative_then_revert_all() {
        let store = store();
        let handlers = Rc::new(HandlerRegistry::new());
        let mut queue = PublishQueue::new(Rc::clone(&store), handlers);
        let id = DataId::new("1");

        let optimistic_id = queue
            .apply_update(OptimisticUpdate::StoreUpdater(Box::new(CreateUser {
                id: id.clone(),
                name: "Opti",
            })))
            .unwrap();
        queue.run().unwrap();
        assert_eq!(
            store.source().get_record(&id).unwrap().get("name"),
            Some(&FieldValue::Scalar("Opti".into()))
        );

        let operation = user_operation(id.clone());
        let mut normalized_source = InMemoryRecordSource::new();
        let mut real = Record::with_typename(id.clone(), "User");
        real.set("name", FieldValue::Scalar("Real".into()));
        normalized_source.set(id.clone(), Arc::new(real));
        queue.commit_payload(
            None,
            None,
            NormalizedPayload {
                source: normalized_source,
                field_payloads: vec![],
            },
            None,
        );
        queue.run().unwrap();
        assert_eq!(
            store.source().get_record(&id).unwrap().get("name"),
            Some(&FieldValue::Scalar("Opti".into())),
            "optimistic update rebases on top of the authoritative write"
        );

        queue.revert_update(optimistic_id);
        queue.run().unwrap();
        assert_eq!(
            store.source().get_record(&id).unwrap().get("name"),
            Some(&FieldValue::Scalar("Real".into())),
            "authoritative write persists once the optimistic update is reverted"
        );
    }

    #[test]
    fn test_revert_all_restores_pre_optimistic_state() {
        let store = store();
        let handlers = Rc::new(HandlerRegistry::new());
        let mut queue = PublishQueue::new(Rc::clone(&store), handlers);
        let id = DataId::new("1");

        queue
            .apply_update(OptimisticUpdate::StoreUpdater(Box::new(CreateUser { id: id.clone(), name: "Opti" })))
            .unwrap();
        queue.run().unwrap();
        assert!(store.source().has(&id));

        queue.revert_all();
        queue.run().unwrap();
        assert!(!store.source().has(&id));
    }

    #[test]
    fn test_gc_hold_reconciled_with_applied_updates() {
        let scheduler = Arc::new(ManualScheduler::new());
        let config = StoreConfig::new().with_gc_scheduler(scheduler.clone());
        let store = Rc::new(Store::new(InMemoryRecordSource::new(), config));
        let handlers = Rc::new(HandlerRegistry::new());
        let mut queue = PublishQueue::new(Rc::clone(&store), handlers);
        let id = DataId::new("1");

        let selector = Arc::new(NormalizationSelector {
            operation_name: "Root".into(),
            selections: Arc::new(vec![]),
        });
        let retain = store.retain(selector, DataId::root(), BTreeMap::new());

        let optimistic_id = queue
            .apply_update(OptimisticUpdate::StoreUpdater(Box::new(CreateUser { id: id.clone(), name: "Opti" })))
            .unwrap();
        queue.run().unwrap();

        retain.dispose();
        assert_eq!(scheduler.pending(), 0, "gc deferred while an optimistic update holds it");

        queue.revert_update(optimistic_id);
        queue.run().unwrap();
        assert_eq!(scheduler.pending(), 1, "gc hold released once no optimistic updates remain applied");
    }

    #[test]
    fn test_apply_update_rejects_duplicate_pending_payload() {
        let store = store();
        let handlers = Rc::new(HandlerRegistry::new());
        let mut queue = PublishQueue::new(Rc::clone(&store), handlers);
        let operation = user_operation(DataId::new("1"));
        let response = serde_json::json!({ "name": "Opti" });

        queue
            .apply_update(OptimisticUpdate::Payload {
                operation: Arc::clone(&operation),
                response: response.clone(),
                updater: None,
            })
            .unwrap();

        let err = queue
            .apply_update(OptimisticUpdate::Payload {
                operation: Arc::clone(&operation),
                response: response.clone(),
                updater: None,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOptimisticUpdate(_)));
    }

    #[test]
    fn test_apply_update_rejects_duplicate_already_applied_payload() {
        let store = store();
        let handlers = Rc::new(HandlerRegistry::new());
        let mut queue = PublishQueue::new(Rc::clone(&store), handlers);
        let operation = user_operation(DataId::new("1"));
        let response = serde_json::json!({ "name": "Opti" });

        queue
            .apply_update(OptimisticUpdate::Payload {
                operation: Arc::clone(&operation),
                response: response.clone(),
                updater: None,
            })
            .unwrap();
        queue.run().unwrap();

        let err = queue
            .apply_update(OptimisticUpdate::Payload {
                operation: Arc::clone(&operation),
                response: response.clone(),
                updater: None,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOptimisticUpdate(_)));
    }
}
