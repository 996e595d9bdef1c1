/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Client-field handles: `@__clientField(handle, key, filters)`.
//!
//! The normalizer never computes a handle field's value itself; it only
//! records that one is needed. A `Handler` is looked up by name out of a
//! `HandlerRegistry` and run afterward, once the sink it reads from has all
//! of the normalized server data in place.

use std::collections::HashMap;

use data_id::DataId;

use crate::error::{Error, Result};
use crate::mutator::RecordSourceMutator;

/// Describes one client field that needs to be computed after normalization.
///
/// `field_key` is the storage key the raw server value was written under;
/// `handle_key` is where the handler should write its derived value. Both
/// are canonicalized the same way ordinary storage keys are, except
/// `handle_key` additionally folds in `handle` and the declared `key` alias
/// so that two different handles on the same field don't collide.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleFieldPayload {
    pub data_id: DataId,
    pub field_key: String,
    pub handle_key: String,
    pub handle: String,
    pub args: Vec<(String, serde_json::Value)>,
    pub filters: Option<Vec<String>>,
}

impl HandleFieldPayload {
    /// The canonical handle-key form: `__<fieldName>_<handle>` when no
    /// explicit `key` alias was given, matching the scenario in the
    /// handle-field literal example (`name` / `friendsName` →
    /// `__name_friendsName`), with any args-filters folded in as
    /// `(name:value,...)` so two differently-parameterized invocations of
    /// the same handle-annotated field (e.g. a paginated connection) don't
    /// collide on one handle key. `filters` restricts which argument names
    /// participate; `None` means all of `args` do.
    pub fn derive_handle_key(field_name: &str, handle: &str, key: &str, args: &[(String, serde_json::Value)], filters: Option<&[String]>) -> String {
        let base = if key.is_empty() {
            format!("__{}_{}", field_name, handle)
        } else {
            format!("__{}_{}", key, handle)
        };
        let rendered = crate::selector::render_handle_args(args, filters);
        if rendered.is_empty() {
            base
        } else {
            format!("{}({})", base, rendered)
        }
    }
}

/// Runs a handle field's derivation. Implementations read `field_key` off
/// the record at `payload.data_id` (via `mutator.get_for_write`) and write
/// their result at `handle_key`.
pub trait Handler {
    fn update(&self, mutator: &mut RecordSourceMutator<'_>, payload: &HandleFieldPayload) -> Result<()>;
}

/// A name → `Handler` lookup table. Looking up an unregistered handle name
/// is a programmer error per the error-handling design (fatal, not a
/// recoverable condition), surfaced here as `Error::HandlerNotFound` so the
/// publish queue can fail the whole `run()` fast rather than publish a
/// partially-handled payload.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Box<dyn Handler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn dispatch(
        &self,
        mutator: &mut RecordSourceMutator<'_>,
        payload: &HandleFieldPayload,
    ) -> Result<()> {
        let handler = self
            .handlers
            .get(&payload.handle)
            .ok_or_else(|| Error::HandlerNotFound(payload.handle.clone()))?;
        handler.update(mutator, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;
    use crate::record_source::InMemoryRecordSource;
    use serde_json::Value as JsonValue;
    use std::sync::Arc;

    struct UppercaseHandler;
    impl Handler for UppercaseHandler {
        fn update(&self, mutator: &mut RecordSourceMutator<'_>, payload: &HandleFieldPayload) -> Result<()> {
            let mut record = mutator
                .get_for_write(&payload.data_id)
                .expect("record must exist for handle field");
            if let Some(FieldValue::Scalar(serde_json::Value::String(s))) =
                record.get(&payload.field_key).cloned()
            {
                record.set(
                    payload.handle_key.clone(),
                    FieldValue::Scalar(s.to_uppercase().into()),
                );
            }
            mutator.set(payload.data_id.clone(), record);
            Ok(())
        }
    }

    #[test]
    fn test_handle_field_scenario() {
        let mut base = InMemoryRecordSource::new();
        let id = DataId::new("1");
        let mut record = crate::record::Record::with_typename(id.clone(), "User");
        record.set("name", FieldValue::Scalar("zuck".into()));
        base.set(id.clone(), Arc::new(record));

        let mut registry = HandlerRegistry::new();
        registry.register("friendsName", Box::new(UppercaseHandler));

        let payload = HandleFieldPayload {
            data_id: id.clone(),
            field_key: "name".into(),
            handle_key: HandleFieldPayload::derive_handle_key("name", "friendsName", "", &[], None),
            handle: "friendsName".into(),
            args: vec![],
            filters: None,
        };
        assert_eq!(payload.handle_key, "__name_friendsName");

        let mut mutator = RecordSourceMutator::new(&base, false);
        registry.dispatch(&mut mutator, &payload).unwrap();
        let (sink, _) = mutator.into_sink_and_backup();
        let updated = sink.get_record(&id).unwrap();
        assert_eq!(
            updated.get("__name_friendsName"),
            Some(&FieldValue::Scalar("ZUCK".into()))
        );
    }

    #[test]
    fn test_derive_handle_key_args_avoid_collision_between_pages() {
        let page_one = HandleFieldPayload::derive_handle_key(
            "friends",
            "friendsConnection",
            "",
            &[("after".into(), JsonValue::from("cursor1"))],
            None,
        );
        let page_two = HandleFieldPayload::derive_handle_key(
            "friends",
            "friendsConnection",
            "",
            &[("after".into(), JsonValue::from("cursor2"))],
            None,
        );
        assert_ne!(page_one, page_two, "differently-paginated invocations must not collide");
    }

    #[test]
    fn test_derive_handle_key_filters_restrict_which_args_participate() {
        let page_one = HandleFieldPayload::derive_handle_key(
            "friends",
            "friendsConnection",
            "",
            &[("after".into(), JsonValue::from("cursor1")), ("orderby".into(), JsonValue::from("name"))],
            Some(&["orderby".to_string()]),
        );
        let page_two = HandleFieldPayload::derive_handle_key(
            "friends",
            "friendsConnection",
            "",
            &[("after".into(), JsonValue::from("cursor2")), ("orderby".into(), JsonValue::from("name"))],
            Some(&["orderby".to_string()]),
        );
        assert_eq!(page_one, page_two, "pagination-only args outside the filter whitelist must not affect the key");
    }

    #[test]
    fn test_unknown_handler_is_error() {
        let base = InMemoryRecordSource::new();
        let registry = HandlerRegistry::new();
        let payload = HandleFieldPayload {
            data_id: DataId::new("1"),
            field_key: "name".into(),
            handle_key: "__name_x".into(),
            handle: "x".into(),
            args: vec![],
            filters: None,
        };
        let mut mutator = RecordSourceMutator::new(&base, false);
        let err = registry.dispatch(&mut mutator, &payload).unwrap_err();
        assert!(matches!(err, Error::HandlerNotFound(_)));
    }
}
