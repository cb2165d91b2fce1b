//! Drift detection between a live component deployment and its desired form
//!
//! Only a few dimensions are compared: replicas, primary container resources,
//! image and environment. Everything else on the live object (status, managed
//! fields, defaults filled in by the API server) is left untouched, so the
//! merged object can be written back with a plain replace.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, EnvVar};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use super::Context;
use crate::config::LogLevelPolicy;
use crate::crd::{Component, TribefireRuntime};
use crate::events::{actions, reasons};
use crate::quantity::resource_lists_equal;
use crate::resources::{DEPLOYMENT_TIMESTAMP_VAR, NODE_ID_VAR, RANDOM_VAR, RUNTIME_LOG_LEVEL_VAR};
use crate::Error;

/// Variables the operator generates per sync or per pod; never compared
pub const UNCOMPARED_ENV_VARS: [&str; 3] = [NODE_ID_VAR, RANDOM_VAR, DEPLOYMENT_TIMESTAMP_VAR];

/// A dimension in which live and desired state can differ
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriftDimension {
    /// Replica count
    Scale,
    /// Requests or limits of the primary container
    Resources,
    /// Image of the primary container
    Image,
    /// Declared environment variables
    Environment,
    /// `TRIBEFIRE_RUNTIME_LOGLEVEL`
    LogLevel,
}

impl DriftDimension {
    /// Event reason emitted for a change in this dimension
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Scale => reasons::COMPONENT_SCALED,
            Self::Resources => reasons::RESOURCES_CHANGED,
            Self::Image => reasons::IMAGE_CHANGED,
            Self::Environment => reasons::ENVIRONMENT_CHANGED,
            Self::LogLevel => reasons::LOG_LEVEL_CHANGED,
        }
    }
}

/// One detected difference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Drift {
    /// What differs
    pub dimension: DriftDimension,
    /// Human-readable description for the event
    pub message: String,
}

/// Outcome of comparing a live deployment against its desired form
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriftReport {
    /// True if the live deployment has to be written back
    pub changed: bool,
    /// Every detected difference, including ones that do not force an update
    pub drifts: Vec<Drift>,
}

impl DriftReport {
    /// Returns true if a difference was found in `dimension`
    pub fn has(&self, dimension: DriftDimension) -> bool {
        self.drifts.iter().any(|d| d.dimension == dimension)
    }

    fn record(&mut self, dimension: DriftDimension, forces_update: bool, message: String) {
        self.changed |= forces_update;
        self.drifts.push(Drift { dimension, message });
    }
}

fn primary_container_mut<'a>(deployment: &'a mut Deployment, name: &str) -> Option<&'a mut Container> {
    let containers = &mut deployment.spec.as_mut()?.template.spec.as_mut()?.containers;
    let index = containers
        .iter()
        .position(|c| c.name == name)
        .unwrap_or(0);
    containers.get_mut(index)
}

fn replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

/// The API server drops an empty `value`, so `None` and `""` are the same
fn same_value(live: &EnvVar, desired: &EnvVar) -> bool {
    live.value.as_deref().unwrap_or_default() == desired.value.as_deref().unwrap_or_default()
}

fn env_value(var: &EnvVar) -> String {
    match (&var.value, &var.value_from) {
        (Some(value), _) => value.clone(),
        (None, Some(_)) => "<reference>".to_string(),
        (None, None) => String::new(),
    }
}

/// Compare `live` against `desired` and merge every difference into `live`.
///
/// Pure: no I/O. The caller writes `live` back when the report says
/// `changed`.
pub fn merge_drift(
    live: &mut Deployment,
    desired: &Deployment,
    log_level_policy: LogLevelPolicy,
) -> DriftReport {
    let mut report = DriftReport::default();

    let (live_replicas, desired_replicas) = (replicas(live), replicas(desired));
    if live_replicas != desired_replicas {
        if let Some(spec) = live.spec.as_mut() {
            spec.replicas = Some(desired_replicas);
        }
        report.record(
            DriftDimension::Scale,
            true,
            format!("from {live_replicas} to {desired_replicas} replicas"),
        );
    }

    let Some(want) = desired
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
    else {
        return report;
    };
    let Some(have) = primary_container_mut(live, &want.name) else {
        return report;
    };

    let want_resources = want.resources.clone().unwrap_or_default();
    let have_resources = have.resources.clone().unwrap_or_default();
    if !resource_lists_equal(have_resources.requests.as_ref(), want_resources.requests.as_ref())
        || !resource_lists_equal(have_resources.limits.as_ref(), want_resources.limits.as_ref())
    {
        have.resources = want.resources.clone();
        report.record(
            DriftDimension::Resources,
            true,
            "resource requests or limits changed".to_string(),
        );
    }

    if have.image != want.image {
        let message = format!(
            "from {} to {}",
            have.image.as_deref().unwrap_or("<none>"),
            want.image.as_deref().unwrap_or("<none>")
        );
        have.image = want.image.clone();
        report.record(DriftDimension::Image, true, message);
    }

    let live_env = have.env.get_or_insert_with(Vec::new);
    let mut changed_vars = Vec::new();
    for var in want.env.iter().flatten() {
        if UNCOMPARED_ENV_VARS.contains(&var.name.as_str()) {
            continue;
        }
        let index = live_env.iter().position(|v| v.name == var.name);
        let differs = index.map_or(true, |i| {
            !same_value(&live_env[i], var) || live_env[i].value_from != var.value_from
        });
        if !differs {
            continue;
        }

        if var.name == RUNTIME_LOG_LEVEL_VAR {
            let previous = index.map(|i| env_value(&live_env[i])).unwrap_or_default();
            report.record(
                DriftDimension::LogLevel,
                log_level_policy == LogLevelPolicy::Apply,
                format!("from {previous} to {}", env_value(var)),
            );
        } else {
            changed_vars.push(var.name.clone());
        }

        match index {
            Some(i) => live_env[i] = var.clone(),
            None => live_env.push(var.clone()),
        }
    }

    if !changed_vars.is_empty() {
        report.record(
            DriftDimension::Environment,
            true,
            format!("changed variables: {}", changed_vars.join(", ")),
        );
    }

    report
}

/// Bring a live component deployment in line with `desired`.
///
/// Emits one event per drifted dimension and issues at most one update.
#[instrument(skip_all, fields(runtime = %runtime.name_any(), component = %component.name()))]
pub async fn reconcile_drift(
    ctx: &Context,
    runtime: &TribefireRuntime,
    component: &Component,
    mut live: Deployment,
    desired: &Deployment,
) -> Result<DriftReport, Error> {
    let report = merge_drift(&mut live, desired, ctx.config.log_level_policy);
    if report.drifts.is_empty() {
        debug!("deployment up to date");
        return Ok(report);
    }

    let object_ref = runtime.object_ref(&());
    for drift in &report.drifts {
        ctx.events
            .publish(
                &object_ref,
                EventType::Normal,
                drift.dimension.reason(),
                actions::SYNC,
                Some(format!("{}: {}", component.name(), drift.message)),
            )
            .await;
    }

    if report.changed {
        ctx.store.update_deployment(&live).await?;
        info!(drifts = report.drifts.len(), "updated deployment");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{test_context, EventCapture, FakeStore};
    use crate::resources::fixtures::{component, runtime};
    use crate::resources::{component_deployment, DeploymentStamp};
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn master() -> (TribefireRuntime, Component) {
        let rt = runtime(vec![component("master", "services")]);
        let master = Component::resolve(&rt.spec.components[0]).unwrap();
        (rt, master)
    }

    fn desired(rt: &TribefireRuntime, c: &Component) -> Deployment {
        let components = vec![c.clone()];
        component_deployment(rt, c, &components, &DeploymentStamp::generate())
    }

    fn container(d: &mut Deployment) -> &mut Container {
        &mut d.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0]
    }

    fn set_env(d: &mut Deployment, name: &str, value: &str) {
        let env = container(d).env.get_or_insert_with(Vec::new);
        env.retain(|v| v.name != name);
        env.push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        });
    }

    fn cpu(request: &str) -> ResourceRequirements {
        ResourceRequirements {
            requests: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity(request.to_string()),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_stamp_is_not_drift() {
        let (rt, master) = master();
        let mut live = desired(&rt, &master);
        // a second render carries a new random value and timestamp
        let report = merge_drift(&mut live, &desired(&rt, &master), LogLevelPolicy::RecordOnly);
        assert!(!report.changed);
        assert!(report.drifts.is_empty());
    }

    #[test]
    fn empty_values_dropped_by_the_server_are_not_drift() {
        let (rt, master) = master();
        let want = desired(&rt, &master);
        let mut live = want.clone();
        let mut dropped = 0;
        for var in container(&mut live).env.iter_mut().flatten() {
            if var.value.as_deref() == Some("") {
                var.value = None;
                dropped += 1;
            }
        }
        // a master without siblings has no explorer, modeler, ... URLs
        assert!(dropped > 0);

        let report = merge_drift(&mut live, &want, LogLevelPolicy::RecordOnly);
        assert!(!report.changed);
        assert!(report.drifts.is_empty());
    }

    #[test]
    fn each_dimension_is_detected_and_merged() {
        let (rt, master) = master();
        let want = desired(&rt, &master);

        let mut live = want.clone();
        live.spec.as_mut().unwrap().replicas = Some(3);
        let report = merge_drift(&mut live, &want, LogLevelPolicy::RecordOnly);
        assert!(report.changed && report.has(DriftDimension::Scale));
        assert_eq!(live.spec.unwrap().replicas, Some(1));

        let mut live = want.clone();
        container(&mut live).image = Some("old/image:1".to_string());
        let report = merge_drift(&mut live, &want, LogLevelPolicy::RecordOnly);
        assert!(report.changed && report.has(DriftDimension::Image));
        let mut want_copy = want.clone();
        assert_eq!(container(&mut live).image, container(&mut want_copy).image);

        let mut live = want.clone();
        container(&mut live).resources = Some(cpu("1"));
        let report = merge_drift(&mut live, &want, LogLevelPolicy::RecordOnly);
        assert!(report.changed && report.has(DriftDimension::Resources));

        let mut live = want.clone();
        set_env(&mut live, "TRIBEFIRE_IS_CLUSTERED", "false");
        let report = merge_drift(&mut live, &want, LogLevelPolicy::RecordOnly);
        assert!(report.changed && report.has(DriftDimension::Environment));
        assert_eq!(report.drifts.len(), 1);
    }

    #[test]
    fn equal_quantities_in_other_notation_are_not_drift() {
        let (rt, mut master) = master();
        master.spec.resources = Some(cpu("500m"));
        let want = desired(&rt, &master);
        let mut live = want.clone();
        container(&mut live).resources = Some(cpu("0.5"));
        assert!(!merge_drift(&mut live, &want, LogLevelPolicy::RecordOnly).changed);
    }

    #[test]
    fn skip_listed_variables_are_ignored() {
        let (rt, master) = master();
        let want = desired(&rt, &master);
        let mut live = want.clone();
        for name in UNCOMPARED_ENV_VARS {
            set_env(&mut live, name, "something-else");
        }
        let report = merge_drift(&mut live, &want, LogLevelPolicy::RecordOnly);
        assert_eq!(report, DriftReport::default());
    }

    #[test]
    fn log_level_is_recorded_but_does_not_force_update() {
        let (rt, master) = master();
        let want = desired(&rt, &master);
        let mut live = want.clone();
        set_env(&mut live, RUNTIME_LOG_LEVEL_VAR, "FINE");

        let report = merge_drift(&mut live, &want, LogLevelPolicy::RecordOnly);
        assert!(!report.changed);
        assert!(report.has(DriftDimension::LogLevel));
        let merged = container(&mut live)
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == RUNTIME_LOG_LEVEL_VAR)
            .and_then(|v| v.value.clone());
        assert_eq!(merged.as_deref(), Some("INFO"));
    }

    #[test]
    fn log_level_forces_update_when_applied() {
        let (rt, master) = master();
        let want = desired(&rt, &master);
        let mut live = want.clone();
        set_env(&mut live, RUNTIME_LOG_LEVEL_VAR, "FINE");

        let report = merge_drift(&mut live, &want, LogLevelPolicy::Apply);
        assert!(report.changed);
    }

    #[tokio::test]
    async fn story_drifted_deployment_gets_one_update_and_one_event_per_dimension() {
        let (rt, master) = master();
        let want = desired(&rt, &master);
        let mut live = want.clone();
        live.spec.as_mut().unwrap().replicas = Some(2);
        container(&mut live).image = Some("old/image:1".to_string());

        let store = FakeStore::with_runtime(rt.clone());
        let events = EventCapture::new();
        let ctx = test_context(store.clone(), events.clone());

        let report = reconcile_drift(&ctx, &rt, &master, live, &want)
            .await
            .unwrap();

        assert!(report.changed);
        assert_eq!(store.deployment_updates().len(), 1);
        assert_eq!(
            events.reasons(),
            [reasons::COMPONENT_SCALED, reasons::IMAGE_CHANGED]
        );
    }

    #[tokio::test]
    async fn story_identical_deployment_is_left_alone() {
        let (rt, master) = master();
        let want = desired(&rt, &master);
        let store = FakeStore::with_runtime(rt.clone());
        let events = EventCapture::new();
        let ctx = test_context(store.clone(), events.clone());

        let report = reconcile_drift(&ctx, &rt, &master, want.clone(), &want)
            .await
            .unwrap();

        assert!(!report.changed);
        assert!(store.deployment_updates().is_empty());
        assert!(events.reasons().is_empty());
    }
}
