//! Builds the compile-time [`ServiceRegistry`] of modules this build of
//! `supd` knows how to load. Dynamic module loading would need `libloading`
//! (and therefore `unsafe`, denied throughout this workspace — see
//! `servicehost`'s own doc comment), so embedders instead register their
//! service factories here, ahead of time, under the names their
//! configuration's `services[].module` fields reference.

use std::sync::Arc;

use servicehost::ServiceRegistry;

/// Returns the registry of service modules this build of `supd` can load.
pub(crate) fn build() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    registry.register("simple_server", Arc::new(echo_service::SimpleServerFactory));
    registry.register("pidfile", Arc::new(echo_service::PidfileFactory));
    registry.register("always_fail", Arc::new(echo_service::AlwaysFailFactory));
    registry
}
