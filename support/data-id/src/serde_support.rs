/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use super::DataId;
use serde::de::{Deserialize, Deserializer, Error, Visitor};
use serde::ser::{Serialize, Serializer};
use std::fmt;

impl Serialize for DataId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

struct DataIdVisitor;

impl<'de> Visitor<'de> for DataIdVisitor {
    type Value = DataId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string")
    }

    fn visit_str<E: Error>(self, v: &str) -> Result<DataId, E> {
        Ok(DataId::new(v))
    }

    fn visit_string<E: Error>(self, v: String) -> Result<DataId, E> {
        Ok(DataId::from(v))
    }
}

impl<'de> Deserialize<'de> for DataId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<DataId, D::Error> {
        deserializer.deserialize_str(DataIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_roundtrip() {
        let id = DataId::new("client:root:viewer");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"client:root:viewer\"");
        let back: DataId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
