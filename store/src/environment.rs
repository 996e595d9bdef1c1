/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The thin outer facade a caller actually drives: `Store` plus
//! `PublishQueue` behind one handle, exposing the operations an embedder
//! needs without reaching into either directly.
//!
//! This is not itself part of the core store/read/normalize/publish design —
//! it exists so a binary with no network or compiler of its own (see the
//! `demos` crate) can exercise the whole pipeline the way a real GraphQL
//! client would: normalize a response, commit it, retain an operation's
//! root, subscribe to a selector, apply and revert optimistic updates.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::handle::HandlerRegistry;
use crate::mutator::RecordSourceMutator;
use crate::normalize::{GetDataId, Normalizer, NormalizerOptions, OperationLoader};
use crate::publish_queue::{NormalizedPayload, OptimisticUpdate, PublishQueue, SelectorUpdater};
use crate::read::Snapshot;
use crate::record_source::InMemoryRecordSource;
use crate::selector::OperationDescriptor;
use crate::store::{Disposable, Store};

/// A query execution's retained handle: holds the operation's root alive
/// (the way a real network layer retains for the lifetime of an in-flight
/// or rendered query) until disposed, alongside which subscriptions fired
/// as a result of committing its response.
pub struct ExecuteResult {
    pub fired: Vec<Arc<OperationDescriptor>>,
    pub retain: Disposable,
}

/// Drives `Store` + `PublishQueue` together as one handle. Construction
/// takes the same `Rc<Store>`/`Rc<HandlerRegistry>` the queue itself takes,
/// so an embedder that wants lower-level access can still reach the `Store`
/// directly (e.g. to build its own `PublishQueue` for tests).
pub struct Environment {
    store: Rc<Store>,
    queue: Rc<RefCell<PublishQueue>>,
}

impl Environment {
    pub fn new(store: Rc<Store>, handlers: Rc<HandlerRegistry>) -> Self {
        let queue = PublishQueue::new(Rc::clone(&store), handlers);
        Environment {
            store,
            queue: Rc::new(RefCell::new(queue)),
        }
    }

    /// Builder-style overrides; only meaningful right after `new`, before any
    /// clone of this `Environment` exists to share the queue handle with.
    pub fn with_get_data_id(self, get_data_id: Rc<dyn GetDataId>) -> Self {
        let queue = Rc::into_inner(self.queue)
            .expect("with_get_data_id must run before the environment is shared")
            .into_inner()
            .with_get_data_id(get_data_id);
        Environment {
            store: self.store,
            queue: Rc::new(RefCell::new(queue)),
        }
    }

    pub fn with_operation_loader(self, operation_loader: Rc<dyn OperationLoader>) -> Self {
        let queue = Rc::into_inner(self.queue)
            .expect("with_operation_loader must run before the environment is shared")
            .into_inner()
            .with_operation_loader(operation_loader);
        Environment {
            store: self.store,
            queue: Rc::new(RefCell::new(queue)),
        }
    }

    pub fn store(&self) -> &Rc<Store> {
        &self.store
    }

    /// Normalizes `response` against `operation`'s normalization selector and
    /// commits it as an authoritative write, retaining the operation's root
    /// for the lifetime of the returned handle. Mirrors what a real
    /// `execute(operation, cacheConfig)` network round-trip would do once its
    /// response lands, minus the actual request — fetching one is a
    /// transport concern this crate has no part of.
    pub fn execute(
        &self,
        operation: Arc<OperationDescriptor>,
        response: &JsonValue,
        get_data_id: &dyn GetDataId,
        operation_loader: &dyn OperationLoader,
    ) -> Result<ExecuteResult> {
        let normalized = self.normalize_payload(&operation, response, get_data_id, operation_loader)?;
        let fired = self.commit_payload(Some(Arc::clone(&operation)), normalized, None)?;
        let retain = self.store.retain(
            Arc::clone(&operation.normalization_selector),
            operation.root_id.clone(),
            operation.variables.clone(),
        );
        Ok(ExecuteResult { fired, retain })
    }

    /// Normalizes `response` and queues+runs it as an authoritative write,
    /// without retaining anything. The lower-level half of `execute`, for
    /// callers (e.g. a mutation response) that don't want a retained root.
    pub fn commit_operation_payload(
        &self,
        operation: Arc<OperationDescriptor>,
        response: &JsonValue,
        get_data_id: &dyn GetDataId,
        operation_loader: &dyn OperationLoader,
        updater: Option<Box<dyn SelectorUpdater>>,
    ) -> Result<Vec<Arc<OperationDescriptor>>> {
        let normalized = self.normalize_payload(&operation, response, get_data_id, operation_loader)?;
        self.commit_payload(Some(operation), normalized, updater)
    }

    fn normalize_payload(
        &self,
        operation: &Arc<OperationDescriptor>,
        response: &JsonValue,
        get_data_id: &dyn GetDataId,
        operation_loader: &dyn OperationLoader,
    ) -> Result<NormalizedPayload> {
        let base = self.store.source();
        let mut mutator = RecordSourceMutator::new(&*base, false);
        let options = NormalizerOptions {
            variables: &operation.variables,
            get_data_id,
            operation_loader,
        };
        let normalizer = Normalizer::new(&mut mutator, &options);
        let field_payloads = normalizer.normalize(&operation.root_id, &operation.normalization_selector.selections, response)?;
        let (source, _) = mutator.into_sink_and_backup();
        Ok(NormalizedPayload { source, field_payloads })
    }

    /// Queues `normalized` as an authoritative payload and runs the queue
    /// immediately, returning the subscriptions it woke.
    pub fn commit_payload(
        &self,
        operation: Option<Arc<OperationDescriptor>>,
        normalized: NormalizedPayload,
        updater: Option<Box<dyn SelectorUpdater>>,
    ) -> Result<Vec<Arc<OperationDescriptor>>> {
        let reader_selector = operation.as_ref().map(|op| Arc::clone(&op.reader_selector));
        let mut queue = self.queue.borrow_mut();
        queue.commit_payload(reader_selector, operation, normalized, updater);
        queue.run()
    }

    /// Commits a raw record source directly (bypassing normalization), e.g.
    /// for a caller that already has normalized writes from elsewhere.
    pub fn commit_source(&self, source: InMemoryRecordSource) -> Result<Vec<Arc<OperationDescriptor>>> {
        let mut queue = self.queue.borrow_mut();
        queue.commit_source(source);
        queue.run()
    }

    /// Applies an optimistic update and runs the queue immediately, so
    /// subscribers see it right away. Disposing the returned handle reverts
    /// exactly this update and re-runs the queue.
    ///
    /// Rejects with `Error::InvalidOptimisticUpdate` if this same update is
    /// already tracked as pending or applied (see `PublishQueue::apply_update`).
    pub fn apply_update(&self, update: OptimisticUpdate) -> Result<Disposable> {
        let id = {
            let mut queue = self.queue.borrow_mut();
            let id = queue.apply_update(update)?;
            if let Err(err) = queue.run() {
                log::warn!("run() failed while applying an optimistic update: {}", err);
            }
            id
        };
        let queue = Rc::clone(&self.queue);
        Ok(Disposable::new(move || {
            let mut queue = queue.borrow_mut();
            queue.revert_update(id);
            if let Err(err) = queue.run() {
                log::warn!("run() failed while reverting an optimistic update: {}", err);
            }
        }))
    }

    pub fn revert_all(&self) -> Result<Vec<Arc<OperationDescriptor>>> {
        let mut queue = self.queue.borrow_mut();
        queue.revert_all();
        queue.run()
    }

    pub fn check(&self, operation: &OperationDescriptor) -> bool {
        self.store.check(&operation.normalization_selector, &operation.root_id, &operation.variables)
    }

    pub fn retain(&self, operation: &OperationDescriptor) -> Disposable {
        self.store.retain(
            Arc::clone(&operation.normalization_selector),
            operation.root_id.clone(),
            operation.variables.clone(),
        )
    }

    pub fn subscribe(&self, snapshot: Snapshot, callback: Box<dyn Fn(&Snapshot)>) -> Disposable {
        self.store.subscribe(snapshot, callback)
    }

    pub fn lookup(&self, operation: &OperationDescriptor) -> Snapshot {
        self.store.lookup(Arc::clone(&operation.reader_selector), None)
    }

    pub fn lookup_selector(&self, selector: Arc<crate::selector::ReaderSelector>, owner: Option<Arc<OperationDescriptor>>) -> Snapshot {
        self.store.lookup(selector, owner)
    }
}
