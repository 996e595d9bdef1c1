/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

#[cfg(feature = "serde_support")]
mod serde_support;

use std::{fmt, ops, str};

/// Opaque identifier for a normalized record in a `RecordSource`.
///
/// This has several benefits over using a bare `String`:
///
/// 1. It's more explicit about what is being stored, and prevents bugs
///    where an arbitrary string is passed to a function expecting a
///    DataID.
///
/// 2. DataIDs are guaranteed to be immutable.
///
/// 3. It's optimized for the IDs actually produced by normalization: most
///    are short (server-provided `id`s, or `type:storageKey` client IDs)
///    and are stored inline without a heap allocation.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DataId(Repr);

#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
enum Repr {
    // invariants: len <= MAX_INLINE_LEN
    Inline(InlineId),
    // invariants: not representable as Repr::Inline
    Heap(Box<str>),
}

// Big enough for the vast majority of client IDs (`client:root:viewer`-style
// strings) without falling back to the heap.
const MAX_INLINE_LEN: usize = 22;

#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
struct InlineId {
    len: u8,
    data: [u8; MAX_INLINE_LEN],
}

impl InlineId {
    #[inline]
    fn from_slice(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_INLINE_LEN);
        let mut data = [0u8; MAX_INLINE_LEN];
        data[..bytes.len()].copy_from_slice(bytes);
        InlineId {
            len: bytes.len() as u8,
            data,
        }
    }

    #[inline]
    fn as_str(&self) -> &str {
        // Only ever constructed from a valid `&str`, so this can't fail.
        str::from_utf8(&self.data[..self.len as usize]).unwrap()
    }
}

impl DataId {
    #[inline]
    pub fn new(s: impl AsRef<str>) -> Self {
        Self::from_str_inner(s.as_ref())
    }

    fn from_str_inner(s: &str) -> Self {
        if s.len() <= MAX_INLINE_LEN {
            DataId(Repr::Inline(InlineId::from_slice(s.as_bytes())))
        } else {
            DataId(Repr::Heap(s.into()))
        }
    }

    /// The well-known ID of the root record, the entry point for every
    /// normalization and reader selector rooted at the query root.
    #[inline]
    pub fn root() -> Self {
        DataId::new("root")
    }

    /// The well-known ID of the `viewer` record, when a schema exposes one.
    #[inline]
    pub fn viewer() -> Self {
        DataId::new("viewer")
    }

    /// Builds a deterministic client-generated ID for a field with no
    /// server-provided identity: `parent:storageKey`, optionally with a
    /// positional suffix for plural fields (`parent:storageKey:i`).
    pub fn client_id(parent: &DataId, storage_key: &str, index: Option<usize>) -> Self {
        match index {
            Some(i) => DataId::new(format!("client:{}:{}:{}", parent.as_str(), storage_key, i)),
            None => DataId::new(format!("client:{}:{}", parent.as_str(), storage_key)),
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        match &self.0 {
            Repr::Inline(rep) => rep.as_str(),
            Repr::Heap(rep) => rep.as_ref(),
        }
    }

    #[inline]
    pub fn into_string(self) -> String {
        self.as_str().to_owned()
    }
}

impl<'a> From<&'a str> for DataId {
    #[inline]
    fn from(s: &'a str) -> DataId {
        DataId::from_str_inner(s)
    }
}

impl From<String> for DataId {
    #[inline]
    fn from(s: String) -> DataId {
        if s.len() <= MAX_INLINE_LEN {
            DataId::from_str_inner(&s)
        } else {
            DataId(Repr::Heap(s.into_boxed_str()))
        }
    }
}

impl From<DataId> for String {
    #[inline]
    fn from(id: DataId) -> String {
        id.into_string()
    }
}

impl AsRef<str> for DataId {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl ops::Deref for DataId {
    type Target = str;
    #[inline]
    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataId({:?})", self.as_str())
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_str(), f)
    }
}

impl PartialEq<str> for DataId {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for DataId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl PartialEq<DataId> for &str {
    fn eq(&self, other: &DataId) -> bool {
        *self == other.as_str()
    }
}
