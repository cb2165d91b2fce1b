//! TribefireRuntime controller
//!
//! [`reconcile`] drives one runtime through finalizer handling, spec sync,
//! drift reconciliation and status reporting. Each stage lives in its own
//! module and works against the collaborators held by [`Context`].

mod context;
mod drift;
mod finalizer;
mod runtime;
mod status;
mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{Context, ContextBuilder, CONTROLLER_NAME};
pub use drift::{
    merge_drift, reconcile_drift, Drift, DriftDimension, DriftReport, UNCOMPARED_ENV_VARS,
};
pub use finalizer::{
    FinalizerLifecycleManager, Finalizers, ForegroundCleanup, NoopCleanup, RuntimeCleanup,
    FINALIZER,
};
pub use runtime::{error_policy, reconcile};
pub use status::{
    derive_health, StatusSynchronizer, AVAILABLE_CONDITION, MESSAGE_AVAILABLE, MESSAGE_DEGRADED,
    PROGRESSING_CONDITION, UNAVAILABLE_URL,
};
pub use sync::SpecSyncEngine;

#[cfg(test)]
pub use finalizer::MockRuntimeCleanup;
