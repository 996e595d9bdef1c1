/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Traces reachable `DataId`s from a normalization selector, for GC
//! mark-sweep.
//!
//! `ReferenceMarker` never reads scalar field values; it only follows
//! `__ref`/`__refs` links and `__typename` (to pick `@match` branches and
//! inline-fragment narrowing), since all it needs to answer is "what's
//! reachable", not "what does it contain". It takes the same concrete
//! `Variables` the operation was normalized with, so storage keys for
//! argumented fields resolve identically to how they were written.

use std::collections::HashSet;

use data_id::DataId;

use crate::record::FieldValue;
use crate::record_source::RecordSource;
use crate::selector::{storage_key, Condition, MatchField, NormalizationSelection, Variables};

/// Marks every `DataId` reachable from `root_id` via `selections` into
/// `marked`. Unresolved `@match` branches (the record's `__typename`
/// doesn't match any compiled branch) still mark the matched child
/// itself reachable, since the record exists even if nothing further is
/// known about its shape.
pub fn mark_references(
    source: &dyn RecordSource,
    root_id: &DataId,
    selections: &[NormalizationSelection],
    variables: &Variables,
    marked: &mut HashSet<DataId>,
) {
    if !marked.insert(root_id.clone()) {
        return; // already visited; selection trees can revisit the same id
    }
    let Some(record) = source.get_record(root_id) else {
        return;
    };
    let typename = record.typename().map(str::to_string);

    for selection in selections {
        mark_selection(source, root_id, typename.as_deref(), selection, variables, marked);
    }
}

fn mark_selection(
    source: &dyn RecordSource,
    id: &DataId,
    typename: Option<&str>,
    selection: &NormalizationSelection,
    variables: &Variables,
    marked: &mut HashSet<DataId>,
) {
    match selection {
        NormalizationSelection::ScalarField { .. } | NormalizationSelection::ClientExtension(_) => {}

        NormalizationSelection::LinkedField {
            field_name,
            args,
            selections,
            ..
        } => {
            let Some(record) = source.get_record(id) else {
                return;
            };
            let key = storage_key(field_name, args, variables);
            match record.get(&key) {
                Some(FieldValue::Ref(child_id)) => {
                    mark_references(source, child_id, selections, variables, marked);
                }
                Some(FieldValue::Refs(children)) => {
                    for child_id in children.iter().flatten() {
                        mark_references(source, child_id, selections, variables, marked);
                    }
                }
                _ => {}
            }
        }

        NormalizationSelection::InlineFragment {
            type_condition,
            selections,
        } => {
            if typename == Some(type_condition.as_str()) {
                for inner in selections {
                    mark_selection(source, id, typename, inner, variables, marked);
                }
            }
        }

        NormalizationSelection::Condition(condition) => {
            mark_condition(source, id, typename, condition, variables, marked);
        }

        NormalizationSelection::MatchField(match_field) => {
            mark_match(source, id, match_field, variables, marked);
        }

        NormalizationSelection::Defer(defer) => {
            for inner in &defer.selections {
                mark_selection(source, id, typename, inner, variables, marked);
            }
        }

        NormalizationSelection::Stream(stream) => {
            for inner in &stream.selections {
                mark_selection(source, id, typename, inner, variables, marked);
            }
        }
    }
}

fn mark_condition(
    source: &dyn RecordSource,
    id: &DataId,
    typename: Option<&str>,
    condition: &Condition,
    variables: &Variables,
    marked: &mut HashSet<DataId>,
) {
    // `@include`/`@skip` gate whether a selection was written at all; a
    // selection that was skipped at normalization time has nothing to mark,
    // so evaluating the condition (rather than conservatively marking both
    // branches) keeps GC precise instead of merely safe.
    let passes = variables
        .get(&condition.variable)
        .and_then(serde_json::Value::as_bool)
        .map(|value| value == condition.passing_value)
        .unwrap_or(false);
    if passes {
        for inner in &condition.selections {
            mark_selection(source, id, typename, inner, variables, marked);
        }
    }
}

fn mark_match(
    source: &dyn RecordSource,
    id: &DataId,
    match_field: &MatchField,
    variables: &Variables,
    marked: &mut HashSet<DataId>,
) {
    let Some(record) = source.get_record(id) else {
        return;
    };
    let key = storage_key(&match_field.field_name, &match_field.args, variables);
    if let Some(FieldValue::Ref(child_id)) = record.get(&key) {
        marked.insert(child_id.clone());
        if let Some(child) = source.get_record(child_id) {
            if let Some(typename) = child.typename() {
                if let Some(branch) = match_field.branches.iter().find(|b| b.type_name == typename) {
                    mark_references(source, child_id, &branch.selections, variables, marked);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::record_source::InMemoryRecordSource;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    fn test_marks_transitive_references() {
        let mut source = InMemoryRecordSource::new();
        let root = DataId::new("root");
        let mut root_record = Record::new(root.clone());
        root_record.set("viewer", FieldValue::Ref(DataId::new("1")));
        source.set(root.clone(), Arc::new(root_record));

        let mut user = Record::with_typename(DataId::new("1"), "User");
        user.set("bestFriend", FieldValue::Ref(DataId::new("2")));
        source.set(DataId::new("1"), Arc::new(user));
        source.set(
            DataId::new("2"),
            Arc::new(Record::with_typename(DataId::new("2"), "User")),
        );
        source.set(
            DataId::new("3"),
            Arc::new(Record::with_typename(DataId::new("3"), "User")),
        );

        let selections = vec![NormalizationSelection::LinkedField {
            field_name: "viewer".into(),
            response_key: "viewer".into(),
            args: vec![],
            concrete_type: None,
            plural: false,
            selections: std::sync::Arc::new(vec![NormalizationSelection::LinkedField {
                field_name: "bestFriend".into(),
                response_key: "bestFriend".into(),
                args: vec![],
                concrete_type: None,
                plural: false,
                selections: std::sync::Arc::new(vec![]),
            }]),
        }];

        let mut marked = HashSet::new();
        let variables: Variables = BTreeMap::new();
        mark_references(&source, &root, &selections, &variables, &mut marked);
        assert!(marked.contains(&root));
        assert!(marked.contains(&DataId::new("1")));
        assert!(marked.contains(&DataId::new("2")));
        assert!(!marked.contains(&DataId::new("3")));
    }
}
