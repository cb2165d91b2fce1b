//! TribefireRuntime reconciliation entry point
//!
//! Each call re-reads the runtime and takes exactly one branch:
//!
//! 1. gone: nothing to do
//! 2. deletion requested with our finalizer: clean up and release it
//! 3. generation already observed: refresh status only
//! 4. finalizer missing: add it and stop, so nothing is provisioned before
//!    it is durable
//! 5. otherwise: full sync

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

use super::finalizer::FinalizerLifecycleManager;
use super::status::StatusSynchronizer;
use super::sync::SpecSyncEngine;
use super::Context;
use crate::crd::TribefireRuntime;
use crate::events::{actions, reasons};
use crate::metrics::{self, origins};
use crate::Error;

/// Backoff multiplier for errors that need a spec change to heal
const CONFIGURATION_BACKOFF_FACTOR: u32 = 6;

/// Reconcile a TribefireRuntime
///
/// Bounded by `reconcile_timeout`; an overrun is reported as
/// [`Error::Timeout`] and retried through [`error_policy`].
#[instrument(skip(runtime, ctx), fields(runtime = %runtime.name_any(), namespace = %runtime.namespace_or_default()))]
pub async fn reconcile(runtime: Arc<TribefireRuntime>, ctx: Arc<Context>) -> Result<Action, Error> {
    metrics::record_reconcile();
    let deadline = ctx.config.reconcile_timeout;
    match tokio::time::timeout(deadline, reconcile_runtime(&runtime, &ctx)).await {
        Ok(result) => result,
        Err(_) => {
            metrics::record_error(origins::GENERAL);
            Err(Error::Timeout(deadline))
        }
    }
}

async fn reconcile_runtime(runtime: &TribefireRuntime, ctx: &Context) -> Result<Action, Error> {
    let name = runtime.name_any();
    let namespace = runtime.namespace_or_default();

    // the watch cache may lag; decide on the stored copy
    let current = match ctx.store.get_runtime(&namespace, &name).await {
        Ok(Some(current)) => current,
        Ok(None) => {
            debug!("runtime no longer exists");
            return Ok(Action::await_change());
        }
        Err(e) => {
            metrics::record_error(origins::RESOURCE_QUERY);
            return Err(e);
        }
    };

    let finalizers = FinalizerLifecycleManager::new(ctx);

    if current.is_being_deleted() {
        if FinalizerLifecycleManager::is_finalizing(&current) {
            info!("finalizing runtime");
            finalizers.finalize(&current).await?;
        }
        return Ok(Action::await_change());
    }

    let observed = current.observed_generation();
    if observed > 0 && observed == current.generation() && !ctx.config.same_generation_reconcile {
        debug!(generation = observed, "generation already synced, refreshing status");
        StatusSynchronizer::new(ctx).sync(&current, None).await?;
        return Ok(Action::requeue(ctx.config.resync_interval));
    }

    if !FinalizerLifecycleManager::has_finalizer(&current) {
        finalizers.add_finalizer(&current).await.inspect_err(|_| {
            metrics::record_error(origins::CLIENT_UPDATE);
        })?;
        // provisioning starts on the next pass, once the finalizer is stored
        return Ok(Action::requeue(Duration::ZERO));
    }

    info!(generation = current.generation(), "syncing runtime");
    SpecSyncEngine::new(ctx).sync(&current).await?;

    ctx.events
        .publish(
            &current.object_ref(&()),
            EventType::Normal,
            reasons::RUNTIME_RECONCILED,
            actions::SYNC,
            Some(format!("Reconciled TribefireRuntime {namespace}/{name}")),
        )
        .await;
    Ok(Action::requeue(ctx.config.resync_interval))
}

/// Error policy for the controller
///
/// Transient errors are retried after `requeue_after`. Errors that need a
/// spec change back off longer.
pub fn error_policy(runtime: Arc<TribefireRuntime>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        runtime = %runtime.name_any(),
        namespace = %runtime.namespace_or_default(),
        "reconciliation failed"
    );

    let delay = if error.is_retryable() {
        ctx.config.requeue_after
    } else {
        ctx.config.requeue_after * CONFIGURATION_BACKOFF_FACTOR
    };
    Action::requeue(delay)
}
