/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Turns a GraphQL response payload into record writes.
//!
//! The normalizer walks a [`NormalizationSelection`] tree in lockstep with
//! a `serde_json::Value` response, writing into a [`RecordSourceMutator`].
//! It never reads from the canonical store directly; callers supply the
//! mutator already positioned over whatever base they want writes to
//! overlay.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use data_id::DataId;

use crate::error::{NormalizationError, Result};
use crate::handle::HandleFieldPayload;
use crate::mutator::RecordSourceMutator;
use crate::record::FieldValue;
use crate::selector::{
    storage_key, ArgumentValue, ClientExtension, Condition, FieldArg, MatchField,
    NormalizationSelection, Variables,
};

const TYPENAME_FIELD: &str = "__typename";

/// Computes the DataID for a linked record. The default strategy prefers
/// the response's own `id` field; callers wanting global-object-id schemes
/// or other conventions supply their own.
pub trait GetDataId {
    fn get_data_id(
        &self,
        field_value: &JsonValue,
        parent_type: Option<&str>,
        field_name: &str,
        args: &[FieldArg],
        variables: &Variables,
    ) -> Option<String>;
}

/// The default `GetDataId`: use the response-provided `id`, if any.
pub struct DefaultGetDataId;

impl GetDataId for DefaultGetDataId {
    fn get_data_id(
        &self,
        field_value: &JsonValue,
        _parent_type: Option<&str>,
        _field_name: &str,
        _args: &[FieldArg],
        _variables: &Variables,
    ) -> Option<String> {
        match field_value.get("id") {
            Some(JsonValue::String(s)) => Some(s.clone()),
            Some(other) if other.is_number() => Some(other.to_string()),
            _ => None,
        }
    }
}

/// Loads the normalization AST for a `@match`/`@module` branch's operation,
/// identified by the `__module_operation_<parentFragment>` value carried on
/// the response. Synchronous by contract: this crate has no async runtime,
/// so an embedder backed by a real asynchronous module loader is expected
/// to block (or pre-resolve and cache) rather than this trait returning a
/// future.
pub trait OperationLoader {
    fn load(&self, module_operation: &str) -> Option<Arc<Vec<NormalizationSelection>>>;
}

/// A no-op loader for embedders that don't use `@match`/`@module`.
pub struct NoopOperationLoader;
impl OperationLoader for NoopOperationLoader {
    fn load(&self, _module_operation: &str) -> Option<Arc<Vec<NormalizationSelection>>> {
        None
    }
}

pub struct NormalizerOptions<'a> {
    pub variables: &'a Variables,
    pub get_data_id: &'a dyn GetDataId,
    pub operation_loader: &'a dyn OperationLoader,
}

/// Drives one normalization pass over a mutator.
pub struct Normalizer<'a, 'm, 'o> {
    mutator: &'m mut RecordSourceMutator<'a>,
    options: &'o NormalizerOptions<'a>,
    handle_payloads: Vec<HandleFieldPayload>,
}

impl<'a, 'm, 'o> Normalizer<'a, 'm, 'o> {
    pub fn new(mutator: &'m mut RecordSourceMutator<'a>, options: &'o NormalizerOptions<'a>) -> Self {
        Normalizer {
            mutator,
            options,
            handle_payloads: Vec::new(),
        }
    }

    /// Normalizes `response` against `selections` rooted at `root_id`, and
    /// returns the handle field payloads collected along the way. Consumes
    /// `self` since a fresh `Normalizer` should be built per pass (it holds
    /// no state worth reusing across responses).
    pub fn normalize(
        mut self,
        root_id: &DataId,
        selections: &[NormalizationSelection],
        response: &JsonValue,
    ) -> Result<Vec<HandleFieldPayload>> {
        log::trace!("normalizing response at root {:?}", root_id);
        self.normalize_selections(root_id, None, selections, response)?;
        Ok(self.handle_payloads)
    }

    fn normalize_selections(
        &mut self,
        id: &DataId,
        parent_type: Option<&str>,
        selections: &[NormalizationSelection],
        response: &JsonValue,
    ) -> Result<()> {
        let mut record = self
            .mutator
            .get_for_write(id)
            .unwrap_or_else(|| self.mutator.create(id.clone(), parent_type.unwrap_or("")));

        if let Some(JsonValue::String(typename)) = response.get(TYPENAME_FIELD) {
            record.set_typename(typename.clone());
        }

        let typename = record.typename().map(str::to_string);
        self.mutator.set(id.clone(), record);

        for selection in selections {
            self.normalize_selection(id, typename.as_deref(), selection, response)?;
        }
        Ok(())
    }

    fn normalize_selection(
        &mut self,
        id: &DataId,
        typename: Option<&str>,
        selection: &NormalizationSelection,
        response: &JsonValue,
    ) -> Result<()> {
        match selection {
            NormalizationSelection::ScalarField {
                field_name,
                response_key,
                args,
            } => self.normalize_scalar(id, field_name, response_key, args, response),

            NormalizationSelection::LinkedField {
                field_name,
                response_key,
                args,
                concrete_type,
                plural,
                selections,
            } => self.normalize_linked(
                id,
                typename,
                field_name,
                response_key,
                args,
                concrete_type.as_deref(),
                *plural,
                selections,
                response,
            ),

            NormalizationSelection::InlineFragment {
                type_condition,
                selections,
            } => {
                if typename == Some(type_condition.as_str()) {
                    for inner in selections {
                        self.normalize_selection(id, typename, inner, response)?;
                    }
                }
                Ok(())
            }

            NormalizationSelection::Condition(condition) => {
                self.normalize_condition(id, typename, condition, response)
            }

            NormalizationSelection::MatchField(match_field) => {
                self.normalize_match(id, match_field, response)
            }

            NormalizationSelection::ClientExtension(extension) => {
                self.normalize_client_extension(id, extension);
                Ok(())
            }

            NormalizationSelection::Defer(defer) => {
                log::trace!("deferred branch {:?} registered for {:?}", defer.label, id);
                for inner in &defer.selections {
                    self.normalize_selection(id, typename, inner, response)?;
                }
                Ok(())
            }

            NormalizationSelection::Stream(stream) => {
                log::trace!("stream branch {:?} registered for {:?}", stream.label, id);
                for inner in &stream.selections {
                    self.normalize_selection(id, typename, inner, response)?;
                }
                Ok(())
            }
        }
    }

    fn normalize_scalar(
        &mut self,
        id: &DataId,
        field_name: &str,
        response_key: &str,
        args: &[FieldArg],
        response: &JsonValue,
    ) -> Result<()> {
        let Some(value) = response.get(response_key) else {
            return Ok(());
        };
        let key = storage_key(field_name, args, self.options.variables);
        let mut record = self.mutator.get_for_write(id).expect("record must exist");
        record.set(key, FieldValue::Scalar(value.clone()));
        self.mutator.set(id.clone(), record);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn normalize_linked(
        &mut self,
        id: &DataId,
        parent_type: Option<&str>,
        field_name: &str,
        response_key: &str,
        args: &[FieldArg],
        concrete_type: Option<&str>,
        plural: bool,
        selections: &[NormalizationSelection],
        response: &JsonValue,
    ) -> Result<()> {
        let key = storage_key(field_name, args, self.options.variables);
        let Some(value) = response.get(response_key) else {
            return Ok(());
        };

        if value.is_null() {
            let mut record = self.mutator.get_for_write(id).expect("record must exist");
            record.set(
                key,
                if plural {
                    FieldValue::Refs(vec![])
                } else {
                    FieldValue::Scalar(JsonValue::Null)
                },
            );
            self.mutator.set(id.clone(), record);
            return Ok(());
        }

        if plural {
            let items = value
                .as_array()
                .ok_or_else(|| NormalizationError::ExpectedList {
                    response_key: response_key.to_string(),
                })?;
            let mut child_ids = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                if item.is_null() {
                    child_ids.push(None);
                    continue;
                }
                let child_id = self.resolve_child_id(
                    item,
                    parent_type,
                    field_name,
                    args,
                    id,
                    &key,
                    Some(index),
                )?;
                self.normalize_selections(&child_id, concrete_type, selections, item)?;
                child_ids.push(Some(child_id));
            }
            let mut record = self.mutator.get_for_write(id).expect("record must exist");
            record.set(key, FieldValue::Refs(child_ids));
            self.mutator.set(id.clone(), record);
        } else {
            if !value.is_object() {
                return Err(NormalizationError::ExpectedObject {
                    response_key: response_key.to_string(),
                }
                .into());
            }
            let child_id =
                self.resolve_child_id(value, parent_type, field_name, args, id, &key, None)?;
            self.normalize_selections(&child_id, concrete_type, selections, value)?;
            let mut record = self.mutator.get_for_write(id).expect("record must exist");
            record.set(key, FieldValue::Ref(child_id));
            self.mutator.set(id.clone(), record);
        }
        Ok(())
    }

    fn resolve_child_id(
        &self,
        value: &JsonValue,
        parent_type: Option<&str>,
        field_name: &str,
        args: &[FieldArg],
        parent_id: &DataId,
        storage_key: &str,
        index: Option<usize>,
    ) -> Result<DataId> {
        if let Some(explicit) = self.options.get_data_id.get_data_id(
            value,
            parent_type,
            field_name,
            args,
            self.options.variables,
        ) {
            return Ok(DataId::new(&explicit));
        }
        Ok(DataId::client_id(parent_id, storage_key, index))
    }

    fn normalize_condition(
        &mut self,
        id: &DataId,
        typename: Option<&str>,
        condition: &Condition,
        response: &JsonValue,
    ) -> Result<()> {
        let value = self
            .options
            .variables
            .get(&condition.variable)
            .and_then(JsonValue::as_bool)
            .ok_or_else(|| NormalizationError::MissingVariable(condition.variable.clone()))?;
        if value == condition.passing_value {
            for inner in &condition.selections {
                self.normalize_selection(id, typename, inner, response)?;
            }
        }
        Ok(())
    }

    fn normalize_match(&mut self, id: &DataId, match_field: &MatchField, response: &JsonValue) -> Result<()> {
        let key = storage_key(&match_field.field_name, &match_field.args, self.options.variables);
        let Some(value) = response.get(&match_field.response_key) else {
            return Ok(());
        };
        if value.is_null() {
            let mut record = self.mutator.get_for_write(id).expect("record must exist");
            record.set(key, FieldValue::Scalar(JsonValue::Null));
            self.mutator.set(id.clone(), record);
            return Ok(());
        }

        let child_id = self.resolve_child_id(
            value,
            None,
            &match_field.field_name,
            &match_field.args,
            id,
            &key,
            None,
        )?;

        let typename = match value.get(TYPENAME_FIELD) {
            Some(JsonValue::String(t)) => t.clone(),
            _ => {
                return Err(NormalizationError::MissingTypename {
                    response_key: match_field.response_key.clone(),
                }
                .into())
            }
        };

        let branch = match_field.branches.iter().find(|b| b.type_name == typename);

        let mut child_record = self
            .mutator
            .get_for_write(&child_id)
            .unwrap_or_else(|| self.mutator.create(child_id.clone(), typename.clone()));
        child_record.set_typename(typename.clone());

        if let Some(component) = value
            .get(format!("__module_component_{}", match_field.field_name))
            .and_then(JsonValue::as_str)
        {
            child_record.set(
                "__module_component",
                FieldValue::Scalar(JsonValue::String(component.to_string())),
            );
        }
        self.mutator.set(child_id.clone(), child_record);

        if let Some(branch) = branch {
            if let Some(module_operation) = value
                .get(format!("__module_operation_{}", match_field.field_name))
                .and_then(JsonValue::as_str)
            {
                // the branch's own AST is already compiled in, but an
                // embedder-supplied loader can override it (e.g. to fetch a
                // freshly split bundle); fall back to the compiled branch.
                let selections = self
                    .options
                    .operation_loader
                    .load(module_operation)
                    .unwrap_or_else(|| Arc::clone(&branch.selections));
                self.normalize_selections(&child_id, Some(&typename), &selections, value)?;
            } else {
                self.normalize_selections(&child_id, Some(&typename), &branch.selections, value)?;
            }
        } else {
            log::debug!(
                "no @module branch registered for typename {:?} on {:?}",
                typename,
                match_field.field_name
            );
        }

        let mut record = self.mutator.get_for_write(id).expect("record must exist");
        record.set(key, FieldValue::Ref(child_id));
        self.mutator.set(id.clone(), record);
        Ok(())
    }

    fn normalize_client_extension(&mut self, id: &DataId, extension: &ClientExtension) {
        let field_key = storage_key(&extension.field_name, &extension.args, self.options.variables);
        let key_alias = extension.key.clone().unwrap_or_default();
        let args: Vec<(String, JsonValue)> = extension
            .args
            .iter()
            .filter_map(|arg| {
                arg.resolve(self.options.variables)
                    .map(|value| (arg.name.clone(), value))
            })
            .collect();
        let handle_key = HandleFieldPayload::derive_handle_key(
            &extension.field_name,
            &extension.handle,
            &key_alias,
            &args,
            extension.filters.as_deref(),
        );
        self.handle_payloads.push(HandleFieldPayload {
            data_id: id.clone(),
            field_key,
            handle_key,
            handle: extension.handle.clone(),
            args,
            filters: extension.filters.clone(),
        });
    }
}
