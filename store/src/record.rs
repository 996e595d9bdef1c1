/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The `Record` value type and the field-value variants it can hold.
//!
//! Modeled after `sync15_traits::Payload`: a reserved `id` plus a flattened
//! JSON map, except a `Record` additionally distinguishes linked references
//! from scalars, and absent keys from explicit `null`.

use serde::de::{Deserializer, Error as DeError, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

use data_id::DataId;

pub const ID_KEY: &str = "__id";
pub const TYPENAME_KEY: &str = "__typename";
const REF_KEY: &str = "__ref";
const REFS_KEY: &str = "__refs";

/// The value stored at a single storage key of a `Record`.
///
/// `Absent` is intentionally not a variant here: a field that hasn't been
/// written is simply missing from `Record::fields`, which is what lets the
/// reader tell "never fetched" apart from "fetched and null".
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A JSON scalar: string, number, bool, or explicit null.
    Scalar(JsonValue),
    /// A singular linked record.
    Ref(DataId),
    /// An ordered, nullable list of linked records.
    Refs(Vec<Option<DataId>>),
}

impl FieldValue {
    pub fn as_ref(&self) -> Option<&DataId> {
        match self {
            FieldValue::Ref(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_refs(&self) -> Option<&[Option<DataId>]> {
        match self {
            FieldValue::Refs(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&JsonValue> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null_scalar(&self) -> bool {
        matches!(self, FieldValue::Scalar(JsonValue::Null))
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Scalar(v) => v.serialize(serializer),
            FieldValue::Ref(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(REF_KEY, id.as_str())?;
                map.end()
            }
            FieldValue::Refs(ids) => {
                let mut map = serializer.serialize_map(Some(1))?;
                let rendered: Vec<Option<&str>> =
                    ids.iter().map(|id| id.as_ref().map(DataId::as_str)).collect();
                map.serialize_entry(REFS_KEY, &rendered)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        Ok(FieldValue::from_json(value))
    }
}

impl FieldValue {
    /// Interprets a raw JSON value as a scalar, ref, or refs field value,
    /// recognizing the `__ref`/`__refs` wire markers documented for a
    /// persisted record source.
    pub fn from_json(value: JsonValue) -> Self {
        if let JsonValue::Object(ref map) = value {
            if map.len() == 1 {
                if let Some(JsonValue::String(id)) = map.get(REF_KEY) {
                    return FieldValue::Ref(DataId::new(id));
                }
                if let Some(JsonValue::Array(items)) = map.get(REFS_KEY) {
                    let ids = items
                        .iter()
                        .map(|item| match item {
                            JsonValue::String(id) => Some(DataId::new(id)),
                            _ => None,
                        })
                        .collect();
                    return FieldValue::Refs(ids);
                }
            }
        }
        FieldValue::Scalar(value)
    }
}

/// A normalized record: the reserved `__id`/`__typename` attributes plus a
/// map of storage key to field value.
///
/// Fields are kept in a `BTreeMap` so that serializing a record (for tests,
/// or for debugging a `RecordSource` dump) is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: DataId,
    typename: Option<String>,
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(id: DataId) -> Self {
        Record {
            id,
            typename: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_typename(id: DataId, typename: impl Into<String>) -> Self {
        let mut record = Record::new(id);
        record.typename = Some(typename.into());
        record
    }

    pub fn id(&self) -> &DataId {
        &self.id
    }

    pub fn typename(&self) -> Option<&str> {
        self.typename.as_deref()
    }

    /// Refines the typename, e.g. from an abstract interface to a concrete
    /// implementing type. Per the data model invariant, `__typename` is
    /// never rewritten to a different, unrelated value once concrete.
    pub fn set_typename(&mut self, typename: impl Into<String>) {
        self.typename = Some(typename.into());
    }

    pub fn get(&self, storage_key: &str) -> Option<&FieldValue> {
        match storage_key {
            ID_KEY => None, // exposed via `id()`, never stored in `fields`
            _ => self.fields.get(storage_key),
        }
    }

    pub fn has(&self, storage_key: &str) -> bool {
        self.fields.contains_key(storage_key)
    }

    pub fn set(&mut self, storage_key: impl Into<String>, value: FieldValue) {
        self.fields.insert(storage_key.into(), value);
    }

    pub fn remove(&mut self, storage_key: &str) -> Option<FieldValue> {
        self.fields.remove(storage_key)
    }

    pub fn storage_keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every linked DataID this record directly points to (used by
    /// `ReferenceMarker` and by the store's identity-recycling diff).
    pub fn linked_ids(&self) -> impl Iterator<Item = &DataId> {
        self.fields.values().flat_map(|v| match v {
            FieldValue::Ref(id) => vec![id],
            FieldValue::Refs(ids) => ids.iter().flatten().collect(),
            FieldValue::Scalar(_) => vec![],
        })
    }

    /// Merges `next` on top of `self`, per the Store.publish field-wise merge
    /// rule: every key present in `next` overwrites the corresponding key in
    /// `self`; keys absent from `next` are left untouched. Returns the merged
    /// record and whether anything actually changed.
    pub fn merge(&self, next: &Record) -> (Record, bool) {
        let mut merged = self.clone();
        let mut changed = false;
        if let Some(typename) = &next.typename {
            if merged.typename.as_deref() != Some(typename.as_str()) {
                merged.typename = Some(typename.clone());
                changed = true;
            }
        }
        for (key, value) in &next.fields {
            if merged.fields.get(key) != Some(value) {
                merged.fields.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        (merged, changed)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2 + self.fields.len()))?;
        map.serialize_entry(ID_KEY, self.id.as_str())?;
        if let Some(typename) = &self.typename {
            map.serialize_entry(TYPENAME_KEY, typename)?;
        }
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;
        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = Record;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a record object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Record, A::Error> {
                let mut id: Option<DataId> = None;
                let mut typename: Option<String> = None;
                let mut fields = BTreeMap::new();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        ID_KEY => id = Some(map.next_value()?),
                        TYPENAME_KEY => typename = Some(map.next_value()?),
                        _ => {
                            fields.insert(key, map.next_value()?);
                        }
                    }
                }
                let id = id.ok_or_else(|| A::Error::missing_field(ID_KEY))?;
                Ok(Record {
                    id,
                    typename,
                    fields,
                })
            }
        }
        deserializer.deserialize_map(RecordVisitor)
    }
}
