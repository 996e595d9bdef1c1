/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Answers "is this operation fully resident in the store?" without
//! materializing a read tree.
//!
//! Structurally a twin of `references::mark_references`, except it stops
//! and returns `false` the moment it finds a required selection absent,
//! rather than continuing to trace reachability.

use data_id::DataId;

use crate::record::FieldValue;
use crate::record_source::RecordSource;
use crate::selector::{storage_key, Condition, MatchField, NormalizationSelection, Variables};

/// Returns whether every selection in `selections`, starting at `root_id`,
/// has a present value in `source`. A tombstoned or never-seen root is
/// immediately incomplete.
pub fn check(source: &dyn RecordSource, root_id: &DataId, selections: &[NormalizationSelection], variables: &Variables) -> bool {
    let Some(record) = source.get_record(root_id) else {
        return false;
    };
    let typename = record.typename().map(str::to_string);
    selections
        .iter()
        .all(|selection| check_selection(source, root_id, typename.as_deref(), selection, variables))
}

fn check_selection(
    source: &dyn RecordSource,
    id: &DataId,
    typename: Option<&str>,
    selection: &NormalizationSelection,
    variables: &Variables,
) -> bool {
    match selection {
        NormalizationSelection::ScalarField { field_name, args, .. } => {
            let key = storage_key(field_name, args, variables);
            source.get_record(id).map(|r| r.has(&key)).unwrap_or(false)
        }

        NormalizationSelection::ClientExtension(_) => true,

        NormalizationSelection::LinkedField {
            field_name,
            args,
            plural,
            selections,
            ..
        } => {
            let key = storage_key(field_name, args, variables);
            let Some(record) = source.get_record(id) else {
                return false;
            };
            match record.get(&key) {
                None => false,
                Some(FieldValue::Scalar(serde_json::Value::Null)) => true,
                Some(FieldValue::Ref(child_id)) if !*plural => check(source, child_id, selections, variables),
                Some(FieldValue::Refs(children)) if *plural => children.iter().all(|child| match child {
                    None => true,
                    Some(child_id) => check(source, child_id, selections, variables),
                }),
                _ => false,
            }
        }

        NormalizationSelection::InlineFragment {
            type_condition,
            selections,
        } => {
            if typename == Some(type_condition.as_str()) {
                selections
                    .iter()
                    .all(|inner| check_selection(source, id, typename, inner, variables))
            } else {
                true
            }
        }

        NormalizationSelection::Condition(condition) => check_condition(source, id, typename, condition, variables),

        NormalizationSelection::MatchField(match_field) => check_match(source, id, match_field, variables),

        NormalizationSelection::Defer(defer) => defer
            .selections
            .iter()
            .all(|inner| check_selection(source, id, typename, inner, variables)),

        NormalizationSelection::Stream(stream) => stream
            .selections
            .iter()
            .all(|inner| check_selection(source, id, typename, inner, variables)),
    }
}

fn check_condition(
    source: &dyn RecordSource,
    id: &DataId,
    typename: Option<&str>,
    condition: &Condition,
    variables: &Variables,
) -> bool {
    let passes = variables
        .get(&condition.variable)
        .and_then(serde_json::Value::as_bool)
        .map(|value| value == condition.passing_value)
        .unwrap_or(false);
    if !passes {
        return true;
    }
    condition
        .selections
        .iter()
        .all(|inner| check_selection(source, id, typename, inner, variables))
}

fn check_match(source: &dyn RecordSource, id: &DataId, match_field: &MatchField, variables: &Variables) -> bool {
    let key = storage_key(&match_field.field_name, &match_field.args, variables);
    let Some(record) = source.get_record(id) else {
        return false;
    };
    match record.get(&key) {
        None => false,
        Some(FieldValue::Scalar(serde_json::Value::Null)) => true,
        Some(FieldValue::Ref(child_id)) => {
            let Some(child) = source.get_record(child_id) else {
                return false;
            };
            match child.typename().and_then(|t| match_field.branches.iter().find(|b| b.type_name == t)) {
                Some(branch) => check(source, child_id, &branch.selections, variables),
                // matched but no compiled branch for this typename: the
                // pointer itself is present, which is all check() can verify.
                None => true,
            }
        }
        _ => false,
    }
}
