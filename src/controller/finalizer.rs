//! Finalizer handling and pre-deletion cleanup
//!
//! A runtime carries [`FINALIZER`] from before the first object is created
//! until cleanup has run. Removing it lets the API server delete the runtime,
//! after which owner references cascade to everything it owns.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::Context;
use crate::crd::{Component, ComponentKind, TribefireRuntime};
use crate::events::{actions, reasons};
use crate::metrics::{self, origins};
use crate::providers::DatabaseProvisioner;
use crate::resources::component_resource_name;
use crate::store::RuntimeStore;
use crate::Error;

/// Finalizer owned by this operator
pub const FINALIZER: &str = "tribefire.cloud/finalizer";

/// Ordered, duplicate-free set of finalizer names
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Finalizers(Vec<String>);

impl Finalizers {
    /// Finalizers currently set on `runtime`
    pub fn of(runtime: &TribefireRuntime) -> Self {
        let mut set = Self::default();
        for name in runtime.finalizers() {
            set.add(name);
        }
        set
    }

    /// Returns true if `name` is in the set
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|f| f == name)
    }

    /// Append `name` unless present. Returns true if the set changed.
    pub fn add(&mut self, name: &str) -> bool {
        if self.contains(name) {
            return false;
        }
        self.0.push(name.to_string());
        true
    }

    /// Remove `name` if present. Returns true if the set changed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|f| f != name);
        self.0.len() != before
    }

    /// Write the set back into `runtime`'s metadata
    pub fn apply_to(self, runtime: &mut TribefireRuntime) {
        runtime.metadata.finalizers = Some(self.0);
    }
}

/// Teardown of state that owner-reference cascade deletion does not cover.
///
/// Must be idempotent: it may run more than once for the same runtime.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuntimeCleanup: Send + Sync {
    /// Clean up after `runtime`
    async fn cleanup(&self, runtime: &TribefireRuntime) -> Result<(), Error>;
}

/// Relies entirely on cascade deletion
pub struct NoopCleanup;

#[async_trait]
impl RuntimeCleanup for NoopCleanup {
    async fn cleanup(&self, _runtime: &TribefireRuntime) -> Result<(), Error> {
        Ok(())
    }
}

/// Deletes the master deployment in the foreground, then drops a managed
/// database. Local databases are left to the shared server.
pub struct ForegroundCleanup {
    store: Arc<dyn RuntimeStore>,
    database: Arc<dyn DatabaseProvisioner>,
}

impl ForegroundCleanup {
    /// Cleanup using the given store and provisioner
    pub fn new(store: Arc<dyn RuntimeStore>, database: Arc<dyn DatabaseProvisioner>) -> Self {
        Self { store, database }
    }
}

#[async_trait]
impl RuntimeCleanup for ForegroundCleanup {
    async fn cleanup(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        let master = runtime
            .spec
            .components
            .iter()
            .filter_map(|spec| Component::resolve(spec).ok())
            .find(|c| c.kind == ComponentKind::Services);

        if let Some(master) = master {
            let name = component_resource_name(runtime, &master);
            debug!(deployment = %name, "deleting master deployment");
            self.store
                .delete_deployment(&runtime.namespace_or_default(), &name)
                .await?;
        }

        if !runtime.spec.is_local_database() {
            self.database.delete_database(runtime).await?;
        }
        Ok(())
    }
}

/// Drives a runtime through finalizer registration and release
pub struct FinalizerLifecycleManager<'a> {
    ctx: &'a Context,
}

impl<'a> FinalizerLifecycleManager<'a> {
    /// Manager working through `ctx`
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Returns true if deletion was requested and our finalizer still blocks it
    pub fn is_finalizing(runtime: &TribefireRuntime) -> bool {
        runtime.is_being_deleted() && Finalizers::of(runtime).contains(FINALIZER)
    }

    /// Returns true if our finalizer is recorded on the runtime
    pub fn has_finalizer(runtime: &TribefireRuntime) -> bool {
        Finalizers::of(runtime).contains(FINALIZER)
    }

    /// Add the finalizer and persist it. A no-op if already present.
    #[instrument(skip_all, fields(runtime = %runtime.name_any()))]
    pub async fn add_finalizer(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        let mut finalizers = Finalizers::of(runtime);
        if !finalizers.add(FINALIZER) {
            return Ok(());
        }
        let mut updated = runtime.clone();
        finalizers.apply_to(&mut updated);
        self.ctx.store.update_finalizers(&updated).await?;
        info!("added finalizer");
        Ok(())
    }

    /// Run cleanup and release the finalizer.
    ///
    /// Cleanup gets `finalizer_attempts` tries; if all fail the finalizer is
    /// released anyway. Only a failure to persist the release is returned.
    #[instrument(skip_all, fields(runtime = %runtime.name_any()))]
    pub async fn finalize(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        let name = runtime.name_any();
        let namespace = runtime.namespace_or_default();
        let object_ref = runtime.object_ref(&());

        self.ctx
            .events
            .publish(
                &object_ref,
                EventType::Normal,
                reasons::RUNTIME_FINALIZING,
                actions::FINALIZE,
                Some(format!("Finalizing TribefireRuntime {namespace}/{name}")),
            )
            .await;

        let attempts = self.ctx.config.finalizer_attempts.max(1);
        for attempt in 1..=attempts {
            match self.ctx.cleanup.cleanup(runtime).await {
                Ok(()) => break,
                Err(e) => warn!(error = %e, attempt, attempts, "cleanup failed"),
            }
        }

        // release on the latest copy so concurrent status writes survive
        let latest = self
            .ctx
            .store
            .get_runtime(&namespace, &name)
            .await
            .inspect_err(|_| metrics::record_error(origins::RESOURCE_QUERY))?;
        let Some(mut latest) = latest else {
            debug!("runtime vanished during finalization");
            return Ok(());
        };
        let mut finalizers = Finalizers::of(&latest);
        if finalizers.remove(FINALIZER) {
            finalizers.apply_to(&mut latest);
            self.ctx
                .store
                .update_finalizers(&latest)
                .await
                .inspect_err(|_| metrics::record_error(origins::RESOURCE_UPDATE))?;
        }

        self.ctx
            .events
            .publish(
                &object_ref,
                EventType::Normal,
                reasons::RUNTIME_FINALIZED,
                actions::FINALIZE,
                Some(format!("Finalized TribefireRuntime {namespace}/{name}")),
            )
            .await;
        info!("finalizer removed");
        Ok(())
    }
}
