/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The compiled selection IR.
//!
//! A compiler upstream of this crate (not part of this crate) turns a
//! GraphQL document into trees of these nodes. The normalizer and reader
//! only ever consume them; nothing here parses GraphQL syntax.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use data_id::DataId;

/// An operation's variables, always kept sorted so that two variable sets
/// with the same values compare and hash identically regardless of the
/// order the caller built them in.
pub type Variables = BTreeMap<String, JsonValue>;

/// A literal or variable-bound argument to a field.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentValue {
    Literal(JsonValue),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldArg {
    pub name: String,
    pub value: ArgumentValue,
}

impl FieldArg {
    pub fn literal(name: impl Into<String>, value: JsonValue) -> Self {
        FieldArg {
            name: name.into(),
            value: ArgumentValue::Literal(value),
        }
    }

    pub fn variable(name: impl Into<String>, variable: impl Into<String>) -> Self {
        FieldArg {
            name: name.into(),
            value: ArgumentValue::Variable(variable.into()),
        }
    }

    /// Resolves this argument's value against a concrete variable set.
    pub fn resolve(&self, variables: &Variables) -> Option<JsonValue> {
        match &self.value {
            ArgumentValue::Literal(v) => Some(v.clone()),
            ArgumentValue::Variable(name) => variables.get(name).cloned(),
        }
    }
}

/// Rebuilds `value` with every nested object's keys sorted, so two
/// logically-identical values built with different key insertion order
/// render to the same string. Needed independent of whether the crate's
/// `serde_json` carries `preserve_order`: that feature (kept on so `read`
/// preserves response field order) turns off `Value::Object`'s own
/// sort-on-serialize behavior, so canonicalization can't be left to
/// `Display`/`to_string` alone.
fn canonical_json(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut sorted: BTreeMap<String, JsonValue> = BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), canonical_json(v));
            }
            let mut out = serde_json::Map::with_capacity(sorted.len());
            for (k, v) in sorted {
                out.insert(k, v);
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// Renders a resolved, already-sorted `(name, value)` list as
/// `name:value,name:value`, canonicalizing each value's key order first.
fn render_canonical_args(resolved: &[(String, JsonValue)]) -> String {
    resolved
        .iter()
        .map(|(name, value)| format!("{}:{}", name, canonical_json(value)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Computes the storage key a field (and its arguments) is written under,
/// e.g. `friends(first:10)` sorted alphabetically by argument name so that
/// equivalent argument orderings produce the same key.
pub fn storage_key(field_name: &str, args: &[FieldArg], variables: &Variables) -> String {
    if args.is_empty() {
        return field_name.to_string();
    }
    let mut resolved: Vec<(String, JsonValue)> = args
        .iter()
        .filter_map(|arg| arg.resolve(variables).map(|v| (arg.name.clone(), v)))
        .collect();
    resolved.sort_by(|a, b| a.0.cmp(&b.0));
    if resolved.is_empty() {
        return field_name.to_string();
    }
    format!("{}({})", field_name, render_canonical_args(&resolved))
}

/// Folds a handle field's resolved arguments into its canonical key, the
/// same way `storage_key` does for ordinary fields. When `filters` is
/// `Some`, only argument names in that whitelist participate (mirroring a
/// connection handler excluding pagination-only args like `after`/`first`
/// so every page of the same connection collapses onto one handle key).
pub(crate) fn render_handle_args(args: &[(String, JsonValue)], filters: Option<&[String]>) -> String {
    let mut resolved: Vec<(String, JsonValue)> = match filters {
        Some(whitelist) => args.iter().filter(|(name, _)| whitelist.contains(name)).cloned().collect(),
        None => args.to_vec(),
    };
    resolved.sort_by(|a, b| a.0.cmp(&b.0));
    render_canonical_args(&resolved)
}

/// A variable-gated inclusion, driving `@include`/`@skip`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub variable: String,
    /// `true` for `@include`, `false` for `@skip`.
    pub passing_value: bool,
    pub selections: Vec<NormalizationSelection>,
}

/// A `@match`/`@module` branch: which concrete type this module handles,
/// and the normalization AST to use for it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchBranch {
    pub type_name: String,
    pub fragment_name: String,
    pub selections: Arc<Vec<NormalizationSelection>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchField {
    pub field_name: String,
    pub response_key: String,
    pub args: Vec<FieldArg>,
    pub branches: Vec<MatchBranch>,
}

/// A single `@__clientField` handle to run after normalization writes the
/// underlying server field.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientExtension {
    pub handle: String,
    pub field_name: String,
    pub args: Vec<FieldArg>,
    pub key: Option<String>,
    pub filters: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeferNode {
    pub label: String,
    pub if_variable: Option<String>,
    pub selections: Vec<NormalizationSelection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamNode {
    pub label: String,
    pub if_variable: Option<String>,
    pub selections: Vec<NormalizationSelection>,
}

/// A node in the tree the normalizer walks while consuming a response.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizationSelection {
    ScalarField {
        field_name: String,
        /// The key this field is read under in the *response* JSON, which
        /// differs from `field_name` when the operation aliased it.
        response_key: String,
        args: Vec<FieldArg>,
    },
    LinkedField {
        field_name: String,
        response_key: String,
        args: Vec<FieldArg>,
        concrete_type: Option<String>,
        plural: bool,
        selections: Arc<Vec<NormalizationSelection>>,
    },
    InlineFragment {
        type_condition: String,
        selections: Vec<NormalizationSelection>,
    },
    Condition(Box<Condition>),
    MatchField(MatchField),
    ClientExtension(ClientExtension),
    Defer(Box<DeferNode>),
    Stream(Box<StreamNode>),
}

/// A node in the tree the reader walks while producing a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderSelection {
    ScalarField {
        field_name: String,
        args: Vec<FieldArg>,
        /// The response key this field is projected under, which can differ
        /// from `field_name` when the operation aliases it.
        response_key: String,
    },
    LinkedField {
        field_name: String,
        args: Vec<FieldArg>,
        response_key: String,
        plural: bool,
        selections: Arc<Vec<ReaderSelection>>,
    },
    InlineFragment {
        type_condition: Option<String>,
        selections: Vec<ReaderSelection>,
    },
    FragmentSpread {
        fragment_name: String,
        args: Vec<FieldArg>,
    },
    /// An `@inline` fragment spread: unlike `FragmentSpread`, this reads
    /// directly into the parent selection rather than producing a separate
    /// fragment reference.
    InlineDataFragmentSpread {
        fragment_name: String,
        selections: Vec<ReaderSelection>,
    },
    Condition(Box<ReaderCondition>),
    MatchField(Box<ReaderMatchField>),
    ClientExtension(ClientExtension),
    Defer(Box<ReaderDeferNode>),
    Stream(Box<ReaderStreamNode>),
}

/// One `@module(name: ...)` branch as seen by the reader: just enough to
/// pick which fragment name to expose under `__fragments` for a matched
/// typename. Unlike the normalization-side `MatchBranch`, no selection tree
/// is carried here — the branch's own data was already written by the
/// normalizer; the reader only emits a fragment pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderMatchBranch {
    pub type_name: String,
    pub fragment_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderMatchField {
    pub field_name: String,
    pub args: Vec<FieldArg>,
    pub response_key: String,
    pub fragment_prop_name: String,
    pub branches: Vec<ReaderMatchBranch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderCondition {
    pub variable: String,
    pub passing_value: bool,
    pub selections: Vec<ReaderSelection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderDeferNode {
    pub label: String,
    pub if_variable: Option<String>,
    pub selections: Vec<ReaderSelection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderStreamNode {
    pub label: String,
    pub if_variable: Option<String>,
    pub selections: Vec<ReaderSelection>,
}

/// The normalization-form half of a compiled operation: what to write when
/// a response for this operation arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationSelector {
    pub operation_name: String,
    pub selections: Arc<Vec<NormalizationSelection>>,
}

/// The reader-form half of a compiled operation, or of a compiled fragment:
/// what to read back out of a `RecordSource`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderSelector {
    pub node_name: String,
    pub data_id: DataId,
    pub variables: Variables,
    pub selections: Arc<Vec<ReaderSelection>>,
}

/// A compiled operation: its name, the concrete variables it was executed
/// with, and both halves of its selection tree.
///
/// Equality and hashing are defined structurally over `(name, variables)`
/// only; two descriptors for the same operation and variables are
/// interchangeable even if their selector trees were built from separately
/// compiled artifacts, since in practice they're always identical.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub name: String,
    pub variables: Variables,
    pub root_id: DataId,
    pub reader_selector: Arc<ReaderSelector>,
    pub normalization_selector: Arc<NormalizationSelector>,
}

impl PartialEq for OperationDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.variables == other.variables
    }
}
impl Eq for OperationDescriptor {}

impl std::hash::Hash for OperationDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        for (k, v) in &self.variables {
            k.hash(state);
            v.to_string().hash(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_sorts_args() {
        let vars: Variables = BTreeMap::new();
        let args = vec![
            FieldArg::literal("last", JsonValue::from(10)),
            FieldArg::literal("orderby", JsonValue::from("name")),
        ];
        assert_eq!(
            storage_key("friends", &args, &vars),
            "friends(last:10,orderby:\"name\")"
        );
    }

    #[test]
    fn test_storage_key_no_args() {
        let vars: Variables = BTreeMap::new();
        assert_eq!(storage_key("name", &[], &vars), "name");
    }

    #[test]
    fn test_storage_key_canonicalizes_object_valued_args_regardless_of_insertion_order() {
        let vars: Variables = BTreeMap::new();
        let mut a = serde_json::Map::new();
        a.insert("x".to_string(), JsonValue::from(1));
        a.insert("y".to_string(), JsonValue::from(2));
        let mut b = serde_json::Map::new();
        b.insert("y".to_string(), JsonValue::from(2));
        b.insert("x".to_string(), JsonValue::from(1));

        let key_a = storage_key("search", &[FieldArg::literal("filter", JsonValue::Object(a))], &vars);
        let key_b = storage_key("search", &[FieldArg::literal("filter", JsonValue::Object(b))], &vars);
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn test_descriptor_equality_ignores_selector_tree() {
        let mut vars_a: Variables = BTreeMap::new();
        vars_a.insert("id".into(), JsonValue::from("1"));
        let vars_b = vars_a.clone();

        let selector_a = Arc::new(ReaderSelector {
            node_name: "UserQuery".into(),
            data_id: DataId::new("1"),
            variables: vars_a.clone(),
            selections: Arc::new(vec![]),
        });
        let selector_b = Arc::new(ReaderSelector {
            node_name: "UserQuery".into(),
            data_id: DataId::new("1"),
            variables: vars_b.clone(),
            selections: Arc::new(vec![ReaderSelection::ScalarField {
                field_name: "name".into(),
                args: vec![],
                response_key: "name".into(),
            }]),
        });
        let norm = Arc::new(NormalizationSelector {
            operation_name: "UserQuery".into(),
            selections: Arc::new(vec![]),
        });

        let a = OperationDescriptor {
            name: "UserQuery".into(),
            variables: vars_a,
            root_id: DataId::new("1"),
            reader_selector: selector_a,
            normalization_selector: norm.clone(),
        };
        let b = OperationDescriptor {
            name: "UserQuery".into(),
            variables: vars_b,
            root_id: DataId::new("1"),
            reader_selector: selector_b,
            normalization_selector: norm,
        };
        assert_eq!(a, b);
    }
}
