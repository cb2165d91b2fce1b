//! Desired shape of every object a runtime owns
//!
//! Everything in here is a pure function of the runtime and its components.
//! Nothing talks to the API server; the sync engine decides what to create or
//! update.

mod activemq;
mod rbac;
mod secrets;
mod workload;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::{Component, TribefireRuntime};

pub use activemq::{activemq_deployment, activemq_name, activemq_service, ACTIVEMQ_PORT};
pub use rbac::{role, role_binding, service_account};
pub use secrets::{
    database_secret, database_secret_name, image_pull_secret, image_pull_secret_name,
    service_account_secret, service_account_secret_name,
};
pub use workload::{
    component_deployment, component_env, component_ingress, component_service,
    ingress_endpoints, ingress_host, url_scheme, DeploymentStamp, DEPLOYMENT_TIMESTAMP_VAR,
    HTTP_PORT, NODE_ID_VAR, RANDOM_VAR, RUNTIME_LOG_LEVEL_VAR,
};

/// Name of an object belonging to `component`, e.g. `demo-tribefire-master`
pub fn component_resource_name(runtime: &TribefireRuntime, component: &Component) -> String {
    format!("{}-{}", runtime.name_any(), component.app_name())
}

/// Labels carried by every object of the runtime
pub fn runtime_labels(runtime: &TribefireRuntime, app: &str) -> BTreeMap<String, String> {
    let name = runtime.name_any();
    BTreeMap::from([
        ("app".to_string(), app.to_string()),
        ("initiative".to_string(), name.clone()),
        ("runtime".to_string(), name),
        ("stage".to_string(), runtime.stage().to_string()),
        ("workspace".to_string(), runtime.namespace_or_default()),
    ])
}

/// Labels that select the pods of one app
pub fn selector_labels(runtime: &TribefireRuntime, app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), app.to_string()),
        ("runtime".to_string(), runtime.name_any()),
    ])
}

/// Metadata for an owned object: namespace, labels and a controller owner
/// reference back to the runtime
pub(crate) fn owned_meta(runtime: &TribefireRuntime, name: String, app: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(runtime.namespace_or_default()),
        labels: Some(runtime_labels(runtime, app)),
        owner_references: runtime.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}
