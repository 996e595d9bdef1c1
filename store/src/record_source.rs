/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The `RecordSource` abstraction: a map from `DataId` to `Record`, plus the
//! tri-state needed to distinguish "never fetched" from "fetched and
//! doesn't exist" from "fetched and present".
//!
//! `Arc<Record>` is load-bearing here, not incidental: the reader's
//! identity-recycling behavior (returning a previously-read object
//! unchanged when its backing record hasn't changed) is implemented by
//! comparing `Arc::ptr_eq` across reads, so every write path that doesn't
//! actually change a record's contents must take care not to allocate a new
//! `Arc` for it.

use std::collections::HashMap;
use std::sync::Arc;

use data_id::DataId;

use crate::record::Record;

/// The state of a single id within a `RecordSource`.
#[derive(Debug, Clone)]
pub enum RecordState {
    /// The id has a record.
    Existent(Arc<Record>),
    /// The id was looked up and confirmed not to exist (a GraphQL null
    /// was normalized at that position, or the record was deleted).
    NonExistent,
    /// The id has never been looked up or written.
    Unknown,
}

impl RecordState {
    pub fn as_option(&self) -> Option<Arc<Record>> {
        match self {
            RecordState::Existent(record) => Some(Arc::clone(record)),
            _ => None,
        }
    }
}

/// Read-only access to a set of records, implemented by every layer of the
/// mutator/store stack (the store's base source, a mutator's merged view
/// over base+sink, a reader's source).
pub trait RecordSource {
    fn get(&self, id: &DataId) -> RecordState;

    fn get_record(&self, id: &DataId) -> Option<Arc<Record>> {
        self.get(id).as_option()
    }

    fn has(&self, id: &DataId) -> bool {
        matches!(self.get(id), RecordState::Existent(_))
    }

    /// Every id this source has an opinion about (for GC sweep, for
    /// iterating a full source dump). Sources that are sparse overlays
    /// (e.g. a publish queue's sink) return only the ids they themselves
    /// hold, not the ids of an underlying base.
    fn ids(&self) -> Vec<DataId>;

    fn size(&self) -> usize {
        self.ids().len()
    }
}

/// A `RecordSource` that can be written to directly (as opposed to through
/// a copy-on-write mutator). The store's committed state is always this;
/// a mutator's `sink` is also this during an optimistic update or payload
/// write.
pub trait MutableRecordSource: RecordSource {
    fn set(&mut self, id: DataId, record: Arc<Record>);

    /// Marks `id` as confirmed non-existent, distinct from simply never
    /// having been written (`Unknown`).
    fn delete(&mut self, id: &DataId);

    fn remove(&mut self, id: &DataId) -> Option<Arc<Record>>;

    fn clear(&mut self);
}

/// The default, in-memory `RecordSource`: a plain hash map plus an explicit
/// tombstone set for deleted ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InMemoryRecordSource {
    records: HashMap<DataId, Arc<Record>>,
    deleted: std::collections::HashSet<DataId>,
}

impl InMemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DataId, &Arc<Record>)> {
        self.records.iter()
    }

    /// Ids explicitly tombstoned in this source (as opposed to simply never
    /// written). Used by `Store::publish` to propagate deletions from a
    /// patch source into the canonical store.
    pub fn deleted_ids(&self) -> impl Iterator<Item = &DataId> {
        self.deleted.iter()
    }

    /// True if this source has no opinion about any id at all — neither a
    /// record nor a tombstone. Distinct from `size() == 0`, which ignores
    /// tombstones; a backup source that is "just tombstones" still has
    /// undo work to do.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.deleted.is_empty()
    }
}

impl RecordSource for InMemoryRecordSource {
    fn get(&self, id: &DataId) -> RecordState {
        if let Some(record) = self.records.get(id) {
            RecordState::Existent(Arc::clone(record))
        } else if self.deleted.contains(id) {
            RecordState::NonExistent
        } else {
            RecordState::Unknown
        }
    }

    fn ids(&self) -> Vec<DataId> {
        self.records.keys().cloned().collect()
    }

    fn size(&self) -> usize {
        self.records.len()
    }
}

impl MutableRecordSource for InMemoryRecordSource {
    fn set(&mut self, id: DataId, record: Arc<Record>) {
        self.deleted.remove(&id);
        self.records.insert(id, record);
    }

    fn delete(&mut self, id: &DataId) {
        self.records.remove(id);
        self.deleted.insert(id.clone());
    }

    fn remove(&mut self, id: &DataId) -> Option<Arc<Record>> {
        self.deleted.remove(id);
        self.records.remove(id)
    }

    fn clear(&mut self) {
        self.records.clear();
        self.deleted.clear();
    }
}
