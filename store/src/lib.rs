/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]

//! A client-side, normalized GraphQL data cache: the runtime half of a
//! Relay-style store, without the compiler that produces its selection ASTs.
//!
//! Three layers compose the public surface:
//!  - [`record_source`]/[`record`]/[`mutator`]: the data model and the
//!    copy-on-write overlay writers go through.
//!  - [`normalize`]/[`read`]/[`check`]/[`references`]/[`gc`]: the pure
//!    functions that turn a response into writes, a selector into a
//!    [`read::Snapshot`], or a source into a smaller one.
//!  - [`store`]/[`publish_queue`]/[`environment`]: the stateful runtime that
//!    coordinates all of the above — retained roots, subscriptions, GC
//!    scheduling, and the optimistic/authoritative write protocol.

mod check;
mod config;
mod environment;
mod error;
mod gc;
mod handle;
mod mutator;
mod normalize;
mod publish_queue;
mod read;
mod record;
mod record_source;
mod references;
mod selector;
mod store;

pub use crate::config::StoreConfig;
pub use crate::environment::{Environment, ExecuteResult};
pub use crate::error::{Error, NormalizationError, Result};
pub use crate::gc::{GcRoot, GcScheduler, ImmediateScheduler, ManualScheduler};
pub use crate::handle::{HandleFieldPayload, Handler, HandlerRegistry};
pub use crate::mutator::{unwind, RecordSourceMutator, RecordSourceProxy};
pub use crate::normalize::{DefaultGetDataId, GetDataId, NoopOperationLoader, Normalizer, NormalizerOptions, OperationLoader};
pub use crate::publish_queue::{
    NoopUpdater, NormalizedPayload, OptimisticUpdate, OptimisticUpdateId, PublishQueue, SelectorUpdater, StoreUpdater,
};
pub use crate::read::{build_variables, read, recycle, recycle_snapshot, Snapshot};
pub use crate::record::{FieldValue, Record};
pub use crate::record_source::{InMemoryRecordSource, MutableRecordSource, RecordSource, RecordState};
pub use crate::selector::{
    ArgumentValue, ClientExtension, Condition, DeferNode, FieldArg, MatchBranch, MatchField, NormalizationSelection,
    NormalizationSelector, OperationDescriptor, ReaderCondition, ReaderDeferNode, ReaderMatchBranch, ReaderMatchField,
    ReaderSelection, ReaderSelector, ReaderStreamNode, StreamNode, Variables,
};
pub use crate::store::{Disposable, Store};

pub use data_id::DataId;
