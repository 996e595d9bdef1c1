/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Copy-on-write writes over a base `RecordSource`.
//!
//! A `RecordSourceMutator` is the thing a normalizer or an optimistic
//! updater actually writes through. It never touches the base source: all
//! writes land in `sink`, and (when backup tracking is enabled) the
//! pre-write value of every touched id is captured in `backup` the first
//! time that id is touched, so the writer's effect can later be undone
//! exactly by replaying `backup` onto `sink`.

use std::sync::Arc;

use data_id::DataId;

use crate::record::Record;
use crate::record_source::{InMemoryRecordSource, MutableRecordSource, RecordSource, RecordState};

/// A base+sink overlay: reads check `sink` first, falling back to `base`.
/// Used both as the mutator's own read view and, after a mutator finishes,
/// as the store's merged view during optimistic application.
pub struct RecordSourceProxy<'a> {
    base: &'a dyn RecordSource,
    sink: &'a InMemoryRecordSource,
}

impl<'a> RecordSourceProxy<'a> {
    pub fn new(base: &'a dyn RecordSource, sink: &'a InMemoryRecordSource) -> Self {
        RecordSourceProxy { base, sink }
    }
}

impl<'a> RecordSource for RecordSourceProxy<'a> {
    fn get(&self, id: &DataId) -> RecordState {
        match self.sink.get(id) {
            RecordState::Unknown => self.base.get(id),
            state => state,
        }
    }

    fn ids(&self) -> Vec<DataId> {
        let mut seen: std::collections::HashSet<DataId> = self.sink.ids().into_iter().collect();
        for id in self.base.ids() {
            seen.insert(id);
        }
        seen.into_iter().collect()
    }
}

/// Writes an update through to `sink`, tracking the pre-write state of every
/// touched id in `backup` the first time (and only the first time) it's
/// touched, so `RecordSourceMutator::unwind` can restore it later.
///
/// This mirrors the "first write wins the backup slot" rule documented for
/// a transactional sync record set: later writes in the same pass overwrite
/// `sink` freely, but never clobber an already-captured `backup` entry.
pub struct RecordSourceMutator<'a> {
    base: &'a dyn RecordSource,
    pub sink: InMemoryRecordSource,
    backup: Option<InMemoryRecordSource>,
}

impl<'a> RecordSourceMutator<'a> {
    pub fn new(base: &'a dyn RecordSource, track_backup: bool) -> Self {
        RecordSourceMutator {
            base,
            sink: InMemoryRecordSource::new(),
            backup: track_backup.then(InMemoryRecordSource::new),
        }
    }

    /// Builds a mutator whose sink starts out pre-populated with `sink`
    /// (e.g. the already-normalized output of a payload commit), rather
    /// than empty. No backup is captured for the seeded entries: they are
    /// fresh writes being layered on, not overlays a caller expects to be
    /// able to undo.
    pub fn from_sink(base: &'a dyn RecordSource, sink: InMemoryRecordSource, track_backup: bool) -> Self {
        RecordSourceMutator {
            base,
            sink,
            backup: track_backup.then(InMemoryRecordSource::new),
        }
    }

    fn capture_backup(&mut self, id: &DataId) {
        if let Some(backup) = &mut self.backup {
            // `Unknown` in `backup` itself (not `self.base`) is the "not
            // captured yet" sentinel, so the first-touch check has to go
            // through `get`, not `has` — `has` is false for a NonExistent
            // backup entry too, which would defeat the first-touch rule on
            // a second write to an id that didn't exist in `base`.
            if matches!(backup.get(id), RecordState::Unknown) {
                match self.base.get(id) {
                    RecordState::Existent(record) => backup.set(id.clone(), record),
                    // Never having existed in `base` reverts, on unwind, to
                    // "not present" the same way an explicit tombstone
                    // does; this crate's `RecordSource` has no third state
                    // to distinguish the two once written back.
                    RecordState::NonExistent | RecordState::Unknown => backup.delete(id),
                }
            }
        }
    }

    pub fn get(&self, id: &DataId) -> RecordState {
        match self.sink.get(id) {
            RecordState::Unknown => self.base.get(id),
            state => state,
        }
    }

    pub fn get_record(&self, id: &DataId) -> Option<Arc<Record>> {
        self.get(id).as_option()
    }

    /// The base source this mutator overlays, for callers that need to
    /// build their own `RecordSourceProxy` (e.g. to re-read a selector
    /// against the mutator's in-progress sink).
    pub fn base(&self) -> &dyn RecordSource {
        self.base
    }

    /// Gets the record at `id` for mutation, cloning it out of the base
    /// source into the sink if it isn't already there. Callers mutate the
    /// returned record and pass it back to `set`.
    pub fn get_for_write(&mut self, id: &DataId) -> Option<Record> {
        self.capture_backup(id);
        match self.get(id) {
            RecordState::Existent(record) => Some((*record).clone()),
            _ => None,
        }
    }

    pub fn set(&mut self, id: DataId, record: Record) {
        self.capture_backup(&id);
        self.sink.set(id, Arc::new(record));
    }

    pub fn delete(&mut self, id: &DataId) {
        self.capture_backup(id);
        self.sink.delete(id);
    }

    pub fn create(&mut self, id: DataId, typename: impl Into<String>) -> Record {
        self.capture_backup(&id);
        Record::with_typename(id, typename)
    }

    /// The backup recorded during this mutator's lifetime, consumed once
    /// the caller is done (typically handed to an `OptimisticUpdate` entry
    /// so it can later be replayed to undo the write).
    pub fn into_sink_and_backup(self) -> (InMemoryRecordSource, Option<InMemoryRecordSource>) {
        (self.sink, self.backup)
    }
}

/// Replays a captured backup onto a sink, undoing exactly the ids that
/// backup touched. `NonExistent` entries in the backup are replayed as
/// deletes; entries absent from backup entirely are left untouched (they
/// were never part of the update being undone).
pub fn unwind(sink: &mut InMemoryRecordSource, backup: &InMemoryRecordSource) {
    let mut ids: std::collections::HashSet<DataId> = backup.ids().into_iter().collect();
    ids.extend(backup.deleted_ids().cloned());
    for id in ids {
        match backup.get(&id) {
            RecordState::Existent(record) => sink.set(id, record),
            RecordState::NonExistent => sink.delete(&id),
            RecordState::Unknown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;

    #[test]
    fn test_backup_captures_first_touch_only() {
        let mut base = InMemoryRecordSource::new();
        let id = DataId::new("1");
        let mut original = Record::with_typename(id.clone(), "User");
        original.set("name", FieldValue::Scalar("Zuck".into()));
        base.set(id.clone(), Arc::new(original.clone()));

        let mut mutator = RecordSourceMutator::new(&base, true);
        let mut record = mutator.get_for_write(&id).unwrap();
        record.set("name", FieldValue::Scalar("Mark".into()));
        mutator.set(id.clone(), record.clone());

        // second write to the same id must not disturb the backup
        let mut record2 = mutator.get_for_write(&id).unwrap();
        record2.set("name", FieldValue::Scalar("Zucc".into()));
        mutator.set(id.clone(), record2);

        let (sink, backup) = mutator.into_sink_and_backup();
        let backup = backup.unwrap();
        assert_eq!(backup.get_record(&id).unwrap().as_ref(), &original);
        assert_eq!(
            sink.get_record(&id).unwrap().get("name"),
            Some(&FieldValue::Scalar("Zucc".into()))
        );
    }

    #[test]
    fn test_unwind_restores_deletion() {
        let mut base = InMemoryRecordSource::new();
        let id = DataId::new("1");
        base.set(id.clone(), Arc::new(Record::with_typename(id.clone(), "User")));

        let mut mutator = RecordSourceMutator::new(&base, true);
        mutator.delete(&id);
        let (mut sink, backup) = mutator.into_sink_and_backup();
        assert!(matches!(sink.get(&id), RecordState::NonExistent));

        unwind(&mut sink, &backup.unwrap());
        assert!(matches!(sink.get(&id), RecordState::Existent(_)));
    }

    #[test]
    fn test_proxy_falls_back_to_base() {
        let mut base = InMemoryRecordSource::new();
        let id = DataId::new("1");
        base.set(id.clone(), Arc::new(Record::new(id.clone())));
        let sink = InMemoryRecordSource::new();
        let proxy = RecordSourceProxy::new(&base, &sink);
        assert!(proxy.has(&id));
    }
}
