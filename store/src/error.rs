/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that a caller can reasonably expect and recover from.
///
/// Conditions that indicate a bug in the *caller* (a compiled selection that
/// references an undefined fragment, a reentrant `run()`) are programmer
/// errors and panic instead of flowing through this type; see
/// `store::publish_queue` and `store::normalize` for where those panics live.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no handler registered for handle {0:?}")]
    HandlerNotFound(String),

    #[error("failed to normalize response: {0}")]
    Normalization(#[from] NormalizationError),

    #[error("optimistic update rejected: {0}")]
    InvalidOptimisticUpdate(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures raised while walking a response payload against a normalization
/// selector. These are always programmer/schema-mismatch errors: a payload
/// that is merely incomplete is not an error (see `isMissingData`).
#[derive(Debug, thiserror::Error)]
pub enum NormalizationError {
    #[error("abstract type at {response_key:?} requires __typename in the response")]
    MissingTypename { response_key: String },

    #[error("expected an object at {response_key:?}, found a scalar or array")]
    ExpectedObject { response_key: String },

    #[error("expected a list at {response_key:?} for a plural field")]
    ExpectedList { response_key: String },

    #[error("condition variable {0:?} was not present in the operation's variables")]
    MissingVariable(String),
}
