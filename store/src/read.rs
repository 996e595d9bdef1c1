/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Materializes tree-shaped read results out of a `RecordSource`.
//!
//! Unlike the normalizer, the reader never writes; it only walks a
//! [`ReaderSelector`] against whatever `RecordSource` it's given (the
//! canonical store, or a mutator's merged base+sink view) and builds a
//! fresh `serde_json::Value` tree, tracking every record it touched along
//! the way so the store knows what to invalidate this read on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use data_id::DataId;

use crate::record::FieldValue;
use crate::record_source::{RecordSource, RecordState};
use crate::selector::{storage_key, OperationDescriptor, ReaderCondition, ReaderSelection, ReaderSelector, Variables};

/// The result of a single read: a data tree, whether anything required was
/// absent, and the set of records the read depended on.
///
/// `data` is wrapped in an `Arc` so that `Store::notify`'s identity
/// recycling can signal "nothing changed here" with `Arc::ptr_eq` rather
/// than a deep value comparison on every subscriber, mirroring how the
/// grounding engine's JS object-identity reuse works.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub selector: Arc<ReaderSelector>,
    pub data: Option<Arc<JsonValue>>,
    pub is_missing_data: bool,
    pub seen_records: HashSet<DataId>,
    /// The operation whose variables/identity a fragment nested in this
    /// read should use if resolved later (propagated into `__fragmentOwner`
    /// pointers). `None` for a read with no owning operation.
    pub owner: Option<Arc<OperationDescriptor>>,
    /// Each record's own materialized subtree, individually `Arc`-wrapped,
    /// keyed by the `DataId` it was read from. `data` is just
    /// `linked[&selector.data_id]`; nested linked fields are duplicated into
    /// their parent's inline value for convenient `.get()` traversal, but
    /// this map is what `recycle_snapshot` actually recycles against, since
    /// it's the only place a nested read subtree has its own `Arc` identity.
    pub linked: HashMap<DataId, Arc<JsonValue>>,
}

struct ReadContext<'s> {
    source: &'s dyn RecordSource,
    variables: Variables,
    owner: Option<Arc<OperationDescriptor>>,
    is_missing_data: bool,
    seen_records: HashSet<DataId>,
    linked: HashMap<DataId, Arc<JsonValue>>,
}

/// Reads `selector` against `source`, producing a [`Snapshot`] owned by
/// `owner` (used to stamp `__fragmentOwner` on any fragment pointers read).
pub fn read(source: &dyn RecordSource, selector: Arc<ReaderSelector>, owner: Option<Arc<OperationDescriptor>>) -> Snapshot {
    let mut ctx = ReadContext {
        source,
        variables: selector.variables.clone(),
        owner: owner.clone(),
        is_missing_data: false,
        seen_records: HashSet::new(),
        linked: HashMap::new(),
    };

    let data = match source.get(&selector.data_id) {
        RecordState::NonExistent => None,
        RecordState::Unknown => {
            ctx.is_missing_data = true;
            ctx.seen_records.insert(selector.data_id.clone());
            None
        }
        RecordState::Existent(_) => {
            ctx.seen_records.insert(selector.data_id.clone());
            let value = read_linked_object(&mut ctx, &selector.data_id, &selector.selections);
            let arc = Arc::new(value);
            ctx.linked.insert(selector.data_id.clone(), Arc::clone(&arc));
            Some(arc)
        }
    };

    Snapshot {
        selector: Arc::clone(&selector),
        data,
        owner,
        is_missing_data: ctx.is_missing_data,
        seen_records: ctx.seen_records,
        linked: ctx.linked,
    }
}

/// Reads the fields of the object at `id` defined by `selections`, assuming
/// the caller has already confirmed `id` exists and added it to
/// `seen_records`.
fn read_linked_object(ctx: &mut ReadContext<'_>, id: &DataId, selections: &[ReaderSelection]) -> JsonValue {
    let record = ctx
        .source
        .get_record(id)
        .expect("caller must confirm existence before calling read_linked_object");
    let mut out = serde_json::Map::new();
    out.insert("__id".into(), JsonValue::String(id.as_str().to_string()));

    for selection in selections {
        read_selection(ctx, id, selection, &mut out);
    }
    JsonValue::Object(out)
}

fn read_selection(
    ctx: &mut ReadContext<'_>,
    id: &DataId,
    selection: &ReaderSelection,
    out: &mut serde_json::Map<String, JsonValue>,
) {
    match selection {
        ReaderSelection::ScalarField {
            field_name,
            args,
            response_key,
        } => {
            let key = storage_key(field_name, args, &ctx.variables);
            let record = ctx.source.get_record(id);
            match record.as_ref().and_then(|r| r.get(&key)) {
                Some(value) => {
                    out.insert(response_key.clone(), field_value_to_json(value));
                }
                None => {
                    ctx.is_missing_data = true;
                }
            }
        }

        ReaderSelection::LinkedField {
            field_name,
            args,
            response_key,
            plural,
            selections,
        } => {
            let key = storage_key(field_name, args, &ctx.variables);
            let record = ctx.source.get_record(id);
            let field = record.as_ref().and_then(|r| r.get(&key));
            match field {
                None => ctx.is_missing_data = true,
                Some(FieldValue::Scalar(JsonValue::Null)) => {
                    out.insert(response_key.clone(), JsonValue::Null);
                }
                Some(FieldValue::Ref(child_id)) if !*plural => {
                    let value = read_child(ctx, child_id, selections);
                    out.insert(response_key.clone(), value);
                }
                Some(FieldValue::Refs(children)) if *plural => {
                    let values: Vec<JsonValue> = children
                        .iter()
                        .map(|child| match child {
                            Some(child_id) => read_child(ctx, child_id, selections),
                            None => JsonValue::Null,
                        })
                        .collect();
                    out.insert(response_key.clone(), JsonValue::Array(values));
                }
                _ => ctx.is_missing_data = true,
            }
        }

        ReaderSelection::InlineFragment {
            type_condition,
            selections,
        } => {
            let matches = match type_condition {
                None => true,
                Some(expected) => {
                    let record = ctx.source.get_record(id);
                    record.as_ref().and_then(|r| r.typename()) == Some(expected.as_str())
                }
            };
            if matches {
                for inner in selections {
                    read_selection(ctx, id, inner, out);
                }
            }
        }

        ReaderSelection::FragmentSpread { fragment_name, args } => {
            let mut fragment_args = serde_json::Map::new();
            for arg in args {
                if let Some(value) = arg.resolve(&ctx.variables) {
                    fragment_args.insert(arg.name.clone(), value);
                }
            }
            let fragments = out
                .entry("__fragments")
                .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
            if let JsonValue::Object(map) = fragments {
                map.insert(fragment_name.clone(), JsonValue::Object(fragment_args));
            }
            out.entry("__fragmentOwner").or_insert_with(|| owner_marker(&ctx.owner));
        }

        ReaderSelection::InlineDataFragmentSpread {
            fragment_name,
            selections,
        } => {
            let mut inner_out = serde_json::Map::new();
            for inner in selections {
                read_selection(ctx, id, inner, &mut inner_out);
            }
            let fragments = out
                .entry("__fragments")
                .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
            if let JsonValue::Object(map) = fragments {
                map.insert(fragment_name.clone(), JsonValue::Object(inner_out));
            }
        }

        ReaderSelection::Condition(condition) => {
            read_condition(ctx, id, condition, out);
        }

        ReaderSelection::MatchField(match_field) => {
            read_match(ctx, id, match_field, out);
        }

        ReaderSelection::ClientExtension(extension) => {
            read_client_extension(ctx, id, extension, out);
        }

        ReaderSelection::Defer(defer) => {
            for inner in &defer.selections {
                read_selection(ctx, id, inner, out);
            }
        }

        ReaderSelection::Stream(stream) => {
            for inner in &stream.selections {
                read_selection(ctx, id, inner, out);
            }
        }
    }
}

fn read_condition(
    ctx: &mut ReadContext<'_>,
    id: &DataId,
    condition: &ReaderCondition,
    out: &mut serde_json::Map<String, JsonValue>,
) {
    let value = ctx
        .variables
        .get(&condition.variable)
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    if value == condition.passing_value {
        for inner in &condition.selections {
            read_selection(ctx, id, inner, out);
        }
    }
}

/// Reads an `@match` field: follows the link, then emits a fragment
/// pointer enriched with `__fragmentPropName`/`__module_component` when the
/// matched record's `__typename` has a compiled `@module` branch, or an
/// empty object (matched, no missing-data) when it doesn't.
fn read_match(
    ctx: &mut ReadContext<'_>,
    id: &DataId,
    match_field: &crate::selector::ReaderMatchField,
    out: &mut serde_json::Map<String, JsonValue>,
) {
    let key = storage_key(&match_field.field_name, &match_field.args, &ctx.variables);
    let record = ctx.source.get_record(id);
    let field = record.as_ref().and_then(|r| r.get(&key));
    let value = match field {
        None => {
            ctx.is_missing_data = true;
            return;
        }
        Some(FieldValue::Scalar(JsonValue::Null)) => {
            out.insert(match_field.response_key.clone(), JsonValue::Null);
            return;
        }
        Some(FieldValue::Ref(child_id)) => child_id.clone(),
        Some(_) => {
            ctx.is_missing_data = true;
            return;
        }
    };

    match ctx.source.get(&value) {
        RecordState::NonExistent => {
            out.insert(match_field.response_key.clone(), JsonValue::Null);
        }
        RecordState::Unknown => {
            ctx.is_missing_data = true;
        }
        RecordState::Existent(child) => {
            ctx.seen_records.insert(value.clone());
            let typename = child.typename();
            let branch = typename.and_then(|t| match_field.branches.iter().find(|b| b.type_name == t));
            let mut pointer = serde_json::Map::new();
            pointer.insert("__id".into(), JsonValue::String(value.as_str().to_string()));
            if let Some(branch) = branch {
                let mut fragments = serde_json::Map::new();
                fragments.insert(branch.fragment_name.clone(), JsonValue::Object(Default::default()));
                pointer.insert("__fragments".into(), JsonValue::Object(fragments));
                pointer.insert("__fragmentOwner".into(), owner_marker(&ctx.owner));
                pointer.insert(
                    "__fragmentPropName".into(),
                    JsonValue::String(match_field.fragment_prop_name.clone()),
                );
                if let Some(component) = child.get("__module_component").and_then(FieldValue::as_scalar) {
                    pointer.insert("__module_component".into(), component.clone());
                }
                out.insert(match_field.response_key.clone(), JsonValue::Object(pointer));
            } else {
                // matched, but no compiled branch for this typename: yield
                // an empty object, not a missing-data signal.
                out.insert(match_field.response_key.clone(), JsonValue::Object(Default::default()));
            }
        }
    }
}

fn owner_marker(owner: &Option<Arc<OperationDescriptor>>) -> JsonValue {
    match owner {
        Some(owner) => JsonValue::String(owner.name.clone()),
        None => JsonValue::Null,
    }
}

fn read_client_extension(
    ctx: &mut ReadContext<'_>,
    id: &DataId,
    extension: &crate::selector::ClientExtension,
    out: &mut serde_json::Map<String, JsonValue>,
) {
    let field_key = storage_key(&extension.field_name, &extension.args, &ctx.variables);
    let key_alias = extension.key.clone().unwrap_or_default();
    let args: Vec<(String, JsonValue)> = extension
        .args
        .iter()
        .filter_map(|arg| arg.resolve(&ctx.variables).map(|value| (arg.name.clone(), value)))
        .collect();
    let handle_key = crate::handle::HandleFieldPayload::derive_handle_key(
        &extension.field_name,
        &extension.handle,
        &key_alias,
        &args,
        extension.filters.as_deref(),
    );
    let record = ctx.source.get_record(id);
    let handle_value = record.as_ref().and_then(|r| r.get(&handle_key));
    match handle_value {
        Some(value) => {
            out.insert(handle_key, field_value_to_json(value));
        }
        None => {
            // missing only if the underlying server field is itself absent
            let raw_present = record.as_ref().map(|r| r.has(&field_key)).unwrap_or(false);
            if !raw_present {
                ctx.is_missing_data = true;
            }
        }
    }
}

fn read_child(ctx: &mut ReadContext<'_>, child_id: &DataId, selections: &[ReaderSelection]) -> JsonValue {
    match ctx.source.get(child_id) {
        RecordState::NonExistent => JsonValue::Null,
        RecordState::Unknown => {
            ctx.is_missing_data = true;
            ctx.seen_records.insert(child_id.clone());
            JsonValue::Null
        }
        RecordState::Existent(_) => {
            ctx.seen_records.insert(child_id.clone());
            let value = read_linked_object(ctx, child_id, selections);
            ctx.linked.insert(child_id.clone(), Arc::new(value.clone()));
            value
        }
    }
}

fn field_value_to_json(value: &FieldValue) -> JsonValue {
    match value {
        FieldValue::Scalar(v) => v.clone(),
        FieldValue::Ref(id) => JsonValue::String(id.as_str().to_string()),
        FieldValue::Refs(ids) => JsonValue::Array(
            ids.iter()
                .map(|id| match id {
                    Some(id) => JsonValue::String(id.as_str().to_string()),
                    None => JsonValue::Null,
                })
                .collect(),
        ),
    }
}

/// Diffs a freshly read `new` snapshot value against the `old` one it's
/// replacing. When the two are value-equal, returns the *old* `Arc` instead
/// of `new`, so that `Arc::ptr_eq` becomes a reliable "nothing changed"
/// signal for subscribers — the Rust analogue of the source engine's
/// object-identity reuse, since `serde_json::Value` has no identity of its
/// own to preserve.
///
/// This only compares the single value given to it; it does not look inside
/// object/array subtrees. Callers that read a tree of nested linked records
/// (anything produced by [`read`]) want [`recycle_snapshot`] instead, which
/// recycles per-record, not just at the top.
pub fn recycle(old: &Option<Arc<JsonValue>>, new: Option<Arc<JsonValue>>) -> Option<Arc<JsonValue>> {
    match (old, &new) {
        (Some(old_arc), Some(new_arc)) if **old_arc == **new_arc => Some(Arc::clone(old_arc)),
        _ => new,
    }
}

/// Recycles a freshly read `new` snapshot against the `old` one it's
/// replacing, at the granularity of individual records rather than the
/// whole tree: for every `DataId` read into both snapshots, if that
/// record's own materialized subtree is unchanged, `new`'s `Arc` for it is
/// swapped for `old`'s. So if a sibling field elsewhere in the tree changed
/// but a given linked record's own subtree didn't, a caller holding a
/// reference to `old.linked[&id]` sees `Arc::ptr_eq` hold against
/// `new.linked[&id]` even though `old.data`/`new.data` themselves differ —
/// matching the per-key identity-recycling invariant, not just a whole-tree
/// one.
pub fn recycle_snapshot(old: &Snapshot, mut new: Snapshot) -> Snapshot {
    for (id, new_arc) in new.linked.iter_mut() {
        if let Some(old_arc) = old.linked.get(id) {
            if !Arc::ptr_eq(old_arc, new_arc) && **old_arc == **new_arc {
                *new_arc = Arc::clone(old_arc);
            }
        }
    }
    new.data = new.linked.get(&new.selector.data_id).cloned();
    new
}

/// Maps fragment/operation variable declarations into a concrete,
/// deterministically ordered variable set.
pub fn build_variables(pairs: impl IntoIterator<Item = (String, JsonValue)>) -> Variables {
    pairs.into_iter().collect::<BTreeMap<_, _>>()
}
