/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Runtime configuration for a `Store`.

use std::sync::Arc;

use crate::gc::{GcScheduler, ImmediateScheduler};

/// Construction-time knobs for a `Store`. There is no config-file format;
/// this is a plain struct built with explicit arguments or the builder
/// methods below, the way a small library component is configured rather
/// than a deployable service.
pub struct StoreConfig {
    pub(crate) gc_scheduler: Arc<dyn GcScheduler>,
    pub(crate) debug_invariant_checks: bool,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the default `ImmediateScheduler` with a caller-supplied
    /// scheduler (e.g. a `ManualScheduler` for deterministic tests).
    pub fn with_gc_scheduler(mut self, scheduler: Arc<dyn GcScheduler>) -> Self {
        self.gc_scheduler = scheduler;
        self
    }

    /// Enables deep "freeze" invariant checks in debug builds: after a
    /// record is published, a shadow copy is retained (see
    /// `Store::publish`/`Store::lookup`) and compared against the live
    /// value on subsequent access, panicking (via `debug_assert_eq!`) if it
    /// no longer matches — i.e. something mutated a record the store had
    /// already published, bypassing `publish()`. Has no effect in release
    /// builds, where the shadow copy itself isn't even kept.
    pub fn with_debug_invariant_checks(mut self, enabled: bool) -> Self {
        self.debug_invariant_checks = enabled;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            gc_scheduler: Arc::new(ImmediateScheduler),
            debug_invariant_checks: cfg!(debug_assertions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_immediate_scheduler_and_debug_checks() {
        let config = StoreConfig::new();
        assert_eq!(config.debug_invariant_checks, cfg!(debug_assertions));
    }

    #[test]
    fn test_builder_overrides_debug_invariant_checks() {
        let config = StoreConfig::new().with_debug_invariant_checks(false);
        assert!(!config.debug_invariant_checks);
    }
}
