//! Runtime health aggregation
//!
//! Status is recomputed from scratch on every pass: component health from the
//! live deployments, endpoints from the ingresses, backend health from a probe.
//! The result is merged into the latest stored copy of the runtime, written
//! when something an observer cares about changed, and then read back until
//! the write is visible.

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::Context;
use crate::crd::{
    apply_defaults, set_condition, Component, ComponentHealth, ComponentStatus, Condition,
    ConditionStatus, DeploymentPhase, TribefireRuntime, TribefireRuntimeStatus,
};
use crate::events::{actions, reasons};
use crate::metrics::{self, origins};
use crate::resources::{component_resource_name, ingress_endpoints, url_scheme};
use crate::retry::{poll_until, retry_fixed};
use crate::Error;

/// Endpoint reported for a component whose ingress could not be read
pub const UNAVAILABLE_URL: &str = "http://unavailable";

/// Condition type for overall component health
pub const AVAILABLE_CONDITION: &str = "Available";

/// Condition type for an ongoing rollout
pub const PROGRESSING_CONDITION: &str = "Progressing";

/// Overall message when every component and the backend are healthy
pub const MESSAGE_AVAILABLE: &str = "available";

/// Overall message otherwise
pub const MESSAGE_DEGRADED: &str = "degraded";

/// Health of a component as seen through its deployment.
///
/// A missing deployment is unavailable. All desired replicas available is
/// available, a partial set is degraded.
pub fn derive_health(deployment: Option<&Deployment>) -> ComponentHealth {
    let Some(deployment) = deployment else {
        return ComponentHealth::Unavailable;
    };
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();
    let available = status.available_replicas.unwrap_or(0);
    let unavailable = status.unavailable_replicas.unwrap_or(0);

    if desired > 0 && available >= desired && unavailable == 0 {
        ComponentHealth::Available
    } else if available > 0 {
        ComponentHealth::Degraded
    } else {
        ComponentHealth::Unavailable
    }
}

/// Status fields that have to be visible after a write
fn persisted(read: &TribefireRuntimeStatus, written: &TribefireRuntimeStatus) -> bool {
    read.message == written.message
        && read.error == written.error
        && read.observed_generation == written.observed_generation
        && read.updated == written.updated
        && read.component_status == written.component_status
}

fn health_event(status: &ComponentStatus) -> (EventType, &'static str) {
    match status.status {
        ComponentHealth::Available => (EventType::Normal, reasons::COMPONENT_AVAILABLE),
        ComponentHealth::Degraded => (EventType::Warning, reasons::COMPONENT_DEGRADED),
        ComponentHealth::Unavailable => (EventType::Warning, reasons::COMPONENT_UNAVAILABLE),
    }
}

/// Computes and persists a runtime's status
pub struct StatusSynchronizer<'a> {
    ctx: &'a Context,
}

impl<'a> StatusSynchronizer<'a> {
    /// Synchronizer working through `ctx`
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Recompute and persist the status of `runtime`.
    ///
    /// `phase` is recorded when a sync pass completed; status-only passes
    /// leave the stored phase alone. Returns
    /// [`Error::StatusUpdateNotPersisted`] if a required write did not become
    /// visible within the configured re-reads.
    #[instrument(skip_all, fields(runtime = %runtime.name_any()))]
    pub async fn sync(
        &self,
        runtime: &TribefireRuntime,
        phase: Option<DeploymentPhase>,
    ) -> Result<(), Error> {
        let name = runtime.name_any();
        let namespace = runtime.namespace_or_default();

        let mut spec = runtime.spec.clone();
        let components = apply_defaults(&mut spec, &self.ctx.config.image_registry)?;

        let mut statuses = Vec::with_capacity(components.len());
        for component in &components {
            statuses.push(self.component_status(runtime, component).await?);
        }

        let mut update_required = self.announce_changes(runtime, &statuses).await;

        let Some(mut latest) = self.ctx.store.get_runtime(&namespace, &name).await? else {
            debug!("runtime vanished before status update");
            return Ok(());
        };

        let first_sync = latest.is_initial_sync();
        let generation = latest.generation();
        let mut status = latest.status.clone().unwrap_or_default();
        let previous_message = status.message.clone();
        let previous_generation = status.observed_generation;

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        if first_sync {
            status.created = Some(now.clone());
        }
        status.updated = Some(now);
        status.observed_generation = generation;
        status.component_status = statuses;
        if let Some(phase) = phase {
            update_required |= status.phase != Some(phase) || status.error;
            status.phase = Some(phase);
            status.error = false;
        }

        let unhealthy: Vec<&str> = status
            .component_status
            .iter()
            .filter(|c| c.status != ComponentHealth::Available)
            .map(|c| c.name.as_str())
            .collect();
        let components_ok = status.all_available();
        let (reason, message) = if components_ok {
            ("ComponentsAvailable", "All components are available".to_string())
        } else {
            (
                "ComponentsUnavailable",
                format!("Components not available: {}", unhealthy.join(", ")),
            )
        };
        update_required |= set_condition(
            &mut status.conditions,
            Condition::new(AVAILABLE_CONDITION, components_ok.into(), reason, message),
        );
        update_required |= set_condition(
            &mut status.conditions,
            Condition::new(
                PROGRESSING_CONDITION,
                (!components_ok).into(),
                if components_ok { "RolloutComplete" } else { "RollingOut" },
                "",
            ),
        );

        let backend_ok = self.probe_backend(&latest, &mut status, &mut update_required).await;

        status.message = Some(
            if components_ok && backend_ok {
                MESSAGE_AVAILABLE
            } else {
                MESSAGE_DEGRADED
            }
            .to_string(),
        );

        let needs_write = update_required
            || first_sync
            || status.message != previous_message
            || status.observed_generation != previous_generation;
        if !needs_write {
            debug!("status unchanged");
            return Ok(());
        }

        latest.status = Some(status.clone());
        if let Err(e) = self.ctx.store.update_status(&latest).await {
            metrics::record_error(origins::STATUS_UPDATE);
            return Err(e);
        }
        metrics::record_status_update();
        info!(message = ?status.message, generation, "status updated");

        self.await_convergence(&namespace, &name, &status).await
    }

    /// Mark the last sync as failed in `phase`. Component health is left as is.
    pub async fn record_failure(
        &self,
        runtime: &TribefireRuntime,
        phase: DeploymentPhase,
    ) -> Result<(), Error> {
        let name = runtime.name_any();
        let namespace = runtime.namespace_or_default();
        let Some(mut latest) = self.ctx.store.get_runtime(&namespace, &name).await? else {
            return Ok(());
        };
        let mut status = latest.status.clone().unwrap_or_default();
        if status.error && status.phase == Some(phase) {
            return Ok(());
        }
        status.error = true;
        status.phase = Some(phase);
        latest.status = Some(status);
        self.ctx.store.update_status(&latest).await?;
        metrics::record_status_update();
        Ok(())
    }

    async fn component_status(
        &self,
        runtime: &TribefireRuntime,
        component: &Component,
    ) -> Result<ComponentStatus, Error> {
        let namespace = runtime.namespace_or_default();
        let resource_name = component_resource_name(runtime, component);

        let deployment = self
            .ctx
            .store
            .get_deployment(&namespace, &resource_name)
            .await?;
        let endpoints = if component.kind.has_ingress() {
            self.resolve_endpoints(&namespace, &resource_name, &url_scheme(runtime, component))
                .await
        } else {
            Vec::new()
        };

        Ok(ComponentStatus {
            name: component.name().to_string(),
            status: derive_health(deployment.as_ref()),
            endpoints,
        })
    }

    /// Read the component's ingress, retrying while it is not yet visible
    async fn resolve_endpoints(&self, namespace: &str, name: &str, scheme: &str) -> Vec<String> {
        let store = &*self.ctx.store;
        let found = retry_fixed(
            &self.ctx.config.endpoint_retry,
            &*self.ctx.sleeper,
            "ingress endpoints",
            move || async move {
                match store.get_ingress(namespace, name).await {
                    Ok(ingress) => ingress
                        .map(|i| ingress_endpoints(&i, scheme))
                        .filter(|urls| !urls.is_empty()),
                    Err(e) => {
                        debug!(error = %e, ingress = %name, "failed to read ingress");
                        None
                    }
                }
            },
        )
        .await;

        found.unwrap_or_else(|| {
            warn!(ingress = %name, "ingress not readable, reporting endpoint as unavailable");
            vec![UNAVAILABLE_URL.to_string()]
        })
    }

    /// Emit an event for every component whose health or endpoints changed.
    /// Returns true if anything changed.
    async fn announce_changes(&self, runtime: &TribefireRuntime, statuses: &[ComponentStatus]) -> bool {
        let previous = runtime
            .status
            .as_ref()
            .map(|s| s.component_status.as_slice())
            .unwrap_or_default();
        let object_ref = runtime.object_ref(&());
        let mut changed = previous.len() != statuses.len();

        for status in statuses {
            let before = previous.iter().find(|p| p.name == status.name);

            if before.map(|b| b.status) != Some(status.status) {
                changed = true;
                let (type_, reason) = health_event(status);
                self.ctx
                    .events
                    .publish(
                        &object_ref,
                        type_,
                        reason,
                        actions::STATUS,
                        Some(format!("Component {} is {}", status.name, status.status)),
                    )
                    .await;
            }

            if before.is_some_and(|b| b.endpoints != status.endpoints) {
                changed = true;
                self.ctx
                    .events
                    .publish(
                        &object_ref,
                        EventType::Normal,
                        reasons::COMPONENT_URL_CHANGED,
                        actions::STATUS,
                        Some(format!(
                            "Component {} is now reachable at {}",
                            status.name,
                            status.endpoints.join(", ")
                        )),
                    )
                    .await;
            }
        }
        changed
    }

    /// Probe the messaging backend and record the result as a condition
    async fn probe_backend(
        &self,
        runtime: &TribefireRuntime,
        status: &mut TribefireRuntimeStatus,
        update_required: &mut bool,
    ) -> bool {
        let backend = &runtime.spec.backend.type_;
        let result = self.ctx.backend.check(runtime).await;

        let condition = match &result {
            Ok(()) => Condition::new(
                backend.condition_type(),
                ConditionStatus::True,
                "BackendReachable",
                format!("{backend} backend is reachable"),
            ),
            Err(e) => Condition::new(
                backend.condition_type(),
                ConditionStatus::False,
                "BackendUnreachable",
                e.to_string(),
            ),
        };
        let flipped = set_condition(&mut status.conditions, condition);
        *update_required |= flipped;

        if let Err(e) = &result {
            warn!(error = %e, %backend, "backend probe failed");
            if flipped {
                self.ctx
                    .events
                    .publish(
                        &runtime.object_ref(&()),
                        EventType::Warning,
                        reasons::BACKEND_UNAVAILABLE,
                        actions::STATUS,
                        Some(format!("{backend} backend is unavailable: {e}")),
                    )
                    .await;
            }
        }
        result.is_ok()
    }

    /// Re-read the runtime until `written` is visible
    async fn await_convergence(
        &self,
        namespace: &str,
        name: &str,
        written: &TribefireRuntimeStatus,
    ) -> Result<(), Error> {
        let policy = &self.ctx.config.status_retry;
        if policy.retries == 0 {
            return Ok(());
        }

        let store = &*self.ctx.store;
        let converged = poll_until(policy, &*self.ctx.sleeper, "status update", move || async move {
            Ok::<_, Error>(
                store
                    .get_runtime(namespace, name)
                    .await?
                    .and_then(|r| r.status)
                    .is_some_and(|s| persisted(&s, written)),
            )
        })
        .await?;

        if converged {
            return Ok(());
        }
        metrics::record_error(origins::STATUS_UPDATE);
        Err(Error::status_not_persisted(name))
    }
}
