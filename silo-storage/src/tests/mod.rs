mod dir_tests;
mod registry_tests;
mod volname_tests;

use crate::registry::PluginRegistry;
use silo_core::FakeRunner;
use std::sync::Arc;

/// A registry over a scripted command runner; returns both so tests can
/// inspect the recorded calls.
pub(crate) fn scripted_registry() -> (Arc<PluginRegistry>, Arc<FakeRunner>) {
    let runner = Arc::new(FakeRunner::new());
    let registry = Arc::new(PluginRegistry::with_defaults(runner.clone()));
    (registry, runner)
}
