//! Service account, role and role binding for a runtime's pods
//!
//! Tribefire nodes discover their peers through the API server, so the role
//! grants read access to pods, services and endpoints of the namespace.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::ResourceExt;

use super::owned_meta;
use crate::crd::TribefireRuntime;

fn read_verbs() -> Vec<String> {
    vec!["get".to_string(), "list".to_string(), "watch".to_string()]
}

/// Service account named after the runtime
pub fn service_account(runtime: &TribefireRuntime) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_meta(runtime, runtime.name_any(), "tribefire"),
        ..Default::default()
    }
}

/// Role named after the runtime
pub fn role(runtime: &TribefireRuntime) -> Role {
    Role {
        metadata: owned_meta(runtime, runtime.name_any(), "tribefire"),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec![
                    "pods".to_string(),
                    "services".to_string(),
                    "endpoints".to_string(),
                ]),
                verbs: read_verbs(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["configmaps".to_string()]),
                verbs: read_verbs(),
                ..Default::default()
            },
        ]),
    }
}

/// Binds the runtime's role to its service account
pub fn role_binding(runtime: &TribefireRuntime) -> RoleBinding {
    let name = runtime.name_any();
    RoleBinding {
        metadata: owned_meta(runtime, name.clone(), "tribefire"),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: Some(runtime.namespace_or_default()),
            ..Default::default()
        }]),
    }
}
