/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Garbage collection: scheduling and the mark-sweep pass itself.

use std::cell::RefCell;
use std::collections::HashSet;

use data_id::DataId;

use crate::record_source::{MutableRecordSource, RecordSource};
use crate::references::mark_references;
use crate::selector::{NormalizationSelection, Variables};

/// A pluggable "run this later" hook for GC passes, mirroring the
/// microtask-equivalent scheduler the source engine dispatches sweeps on.
pub trait GcScheduler {
    fn schedule(&self, thunk: Box<dyn FnOnce() + 'static>);
}

/// Runs the thunk synchronously, on the calling thread, the moment it's
/// scheduled. The right choice for a library with no event loop of its own.
pub struct ImmediateScheduler;

impl GcScheduler for ImmediateScheduler {
    fn schedule(&self, thunk: Box<dyn FnOnce() + 'static>) {
        thunk();
    }
}

/// Queues thunks for a test to pump explicitly with `flush`, so GC timing
/// can be asserted on rather than racing a real scheduler.
#[derive(Default)]
pub struct ManualScheduler {
    queue: RefCell<Vec<Box<dyn FnOnce() + 'static>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Runs every thunk queued so far, in order queued.
    pub fn flush(&self) {
        let thunks: Vec<_> = self.queue.borrow_mut().drain(..).collect();
        for thunk in thunks {
            thunk();
        }
    }
}

impl GcScheduler for ManualScheduler {
    fn schedule(&self, thunk: Box<dyn FnOnce() + 'static>) {
        self.queue.borrow_mut().push(thunk);
    }
}

/// One retained GC root: the selections and concrete variables a retained
/// operation was normalized with, which `ReferenceMarker` needs to resolve
/// the same storage keys that were written.
pub struct GcRoot {
    pub root_id: DataId,
    pub selections: std::sync::Arc<Vec<NormalizationSelection>>,
    pub variables: Variables,
}

/// Runs one mark-sweep pass: marks everything reachable from `roots`, then
/// removes (hard forget, not tombstone) anything in `source` that wasn't
/// marked. With no roots at all, the entire source is cleared, matching the
/// "nothing retained means nothing is kept alive" contract.
pub fn sweep(source: &mut dyn MutableRecordSource, roots: &[GcRoot]) {
    if roots.is_empty() {
        log::debug!("gc: no retained roots, clearing source");
        source.clear();
        return;
    }

    let mut marked: HashSet<DataId> = HashSet::new();
    for root in roots {
        mark_references(source, &root.root_id, &root.selections, &root.variables, &mut marked);
    }

    let to_remove: Vec<DataId> = source.ids().into_iter().filter(|id| !marked.contains(id)).collect();
    log::debug!(
        "gc: {} reachable, {} collected",
        marked.len(),
        to_remove.len()
    );
    for id in to_remove {
        source.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldValue, Record};
    use crate::record_source::InMemoryRecordSource;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    fn test_manual_scheduler_defers_until_flush() {
        let scheduler = ManualScheduler::new();
        let ran = Arc::new(std::cell::Cell::new(false));
        let ran_clone = Arc::clone(&ran);
        scheduler.schedule(Box::new(move || ran_clone.set(true)));
        assert!(!ran.get());
        scheduler.flush();
        assert!(ran.get());
    }

    #[test]
    fn test_sweep_with_no_roots_clears_everything() {
        let mut source = InMemoryRecordSource::new();
        source.set(DataId::new("1"), Arc::new(Record::new(DataId::new("1"))));
        sweep(&mut source, &[]);
        assert_eq!(source.size(), 0);
    }

    #[test]
    fn test_sweep_keeps_only_reachable() {
        let mut source = InMemoryRecordSource::new();
        let root_id = DataId::new("root");
        let mut root = Record::new(root_id.clone());
        root.set("viewer", FieldValue::Ref(DataId::new("1")));
        source.set(root_id.clone(), Arc::new(root));
        source.set(
            DataId::new("1"),
            Arc::new(Record::with_typename(DataId::new("1"), "User")),
        );
        source.set(
            DataId::new("orphan"),
            Arc::new(Record::with_typename(DataId::new("orphan"), "User")),
        );

        let roots = vec![GcRoot {
            root_id: root_id.clone(),
            selections: Arc::new(vec![NormalizationSelection::LinkedField {
                field_name: "viewer".into(),
                response_key: "viewer".into(),
                args: vec![],
                concrete_type: None,
                plural: false,
                selections: Arc::new(vec![]),
            }]),
            variables: BTreeMap::new(),
        }];
        sweep(&mut source, &roots);
        assert!(source.has(&root_id));
        assert!(source.has(&DataId::new("1")));
        assert!(!source.has(&DataId::new("orphan")));
    }
}
