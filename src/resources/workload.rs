//! Deployment, service and ingress for a component

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, LocalObjectReference,
    ObjectFieldSelector, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe,
    SecretKeySelector, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::Rng;

use super::secrets::{
    database_secret_name, image_pull_secret_name, service_account_secret_name,
    SERVICE_ACCOUNT_KEY,
};
use super::{component_resource_name, owned_meta, selector_labels};
use crate::crd::{Component, ComponentKind, TribefireRuntime, DEFAULT_DOMAIN};

/// Port every component serves HTTP on
pub const HTTP_PORT: i32 = 8080;

/// Log level of the runtime
pub const RUNTIME_LOG_LEVEL_VAR: &str = "TRIBEFIRE_RUNTIME_LOGLEVEL";
/// Cluster node id, derived from pod name and random value
pub const NODE_ID_VAR: &str = "TRIBEFIRE_NODE_ID";
/// Random value regenerated on every sync
pub const RANDOM_VAR: &str = "TF_OPERATOR_RANDOM";
/// Time of the sync that produced the deployment
pub const DEPLOYMENT_TIMESTAMP_VAR: &str = "DEPLOYMENT_TIMESTAMP";

const CLOUDSQL_VOLUME: &str = "cloudsql-credentials";
const CLOUDSQL_MOUNT_PATH: &str = "/cloudsql";

/// Per-sync values that end up in the component environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentStamp {
    /// `RND-` followed by ten alphanumeric characters
    pub random: String,
    /// RFC 3339 time of the sync
    pub timestamp: String,
}

impl DeploymentStamp {
    /// Fresh random value and the current time
    pub fn generate() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        Self {
            random: format!("RND-{suffix}"),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Host the component is published under: the host of its public URL, or
/// `<runtime>-<namespace>.<domain>`
pub fn ingress_host(runtime: &TribefireRuntime, component: &Component) -> String {
    match component.spec.public_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => {
            let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
            without_scheme
                .split('/')
                .next()
                .unwrap_or(without_scheme)
                .to_string()
        }
        None => format!(
            "{}-{}.{}",
            runtime.name_any(),
            runtime.namespace_or_default(),
            runtime.spec.domain()
        ),
    }
}

/// Scheme of the component's public URLs; plain http on the local domain
pub fn url_scheme(runtime: &TribefireRuntime, component: &Component) -> String {
    if runtime.spec.domain() == DEFAULT_DOMAIN {
        return "http".to_string();
    }
    component
        .spec
        .protocol
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "https".to_string())
}

/// Public URL of the first component of the given kind
fn public_url(base_url: &str, components: &[Component], kind: &ComponentKind) -> Option<String> {
    components
        .iter()
        .find(|c| &c.kind == kind)
        .map(|c| format!("{base_url}{}", c.api_path()))
}

/// Environment of the component's primary container.
///
/// User-declared variables come last so they override generated ones.
pub fn component_env(
    runtime: &TribefireRuntime,
    component: &Component,
    components: &[Component],
    stamp: &DeploymentStamp,
) -> Vec<EnvVar> {
    let name = runtime.name_any();
    let namespace = runtime.namespace_or_default();
    let host = ingress_host(runtime, component);
    let base_url = format!("{}://{}", url_scheme(runtime, component), host);
    let master_api_path = components
        .iter()
        .find(|c| c.kind == ComponentKind::Services)
        .map(Component::api_path)
        .unwrap_or_else(|| ComponentKind::Services.default_api_path(""));

    let mut vars = vec![
        env(
            "TRIBEFIRE_SERVICES_URL",
            format!("http://{name}-tribefire-master:{HTTP_PORT}"),
        ),
        env(
            "TRIBEFIRE_PUBLIC_SERVICES_URL",
            format!("{base_url}{master_api_path}"),
        ),
    ];

    for (var, kind) in [
        ("TRIBEFIRE_EXPLORER_URL", ComponentKind::Explorer),
        ("TRIBEFIRE_MODELER_URL", ComponentKind::Modeler),
        ("TRIBEFIRE_WEBREADER_URL", ComponentKind::WebReader),
        ("TRIBEFIRE_CONTROL_CENTER_URL", ComponentKind::ControlCenter),
    ] {
        let url = public_url(&base_url, components, &kind).unwrap_or_default();
        vars.push(env(var, url));
    }

    vars.push(env("INITIATIVE_NAME", name.clone()));
    vars.push(env("WORKSPACE_NAME", namespace.clone()));
    vars.push(env(RANDOM_VAR, stamp.random.clone()));
    vars.push(EnvVar {
        name: "TF_OPERATOR_POD_ID".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                // the API server fills apiVersion in; set it so drift stays quiet
                api_version: Some("v1".to_string()),
                field_path: "metadata.name".to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    });
    if let Some(stage) = runtime.labels().get("stage") {
        vars.push(env("INITIATIVE_STAGE", stage.clone()));
    }
    vars.push(env(RUNTIME_LOG_LEVEL_VAR, component.log_level()));

    match &component.kind {
        ComponentKind::Services => {
            push_processing_env(&mut vars, &name, &namespace);
            push_master_env(&mut vars, runtime, &host, stamp);
        }
        ComponentKind::Cartridge { .. } => {
            push_processing_env(&mut vars, &name, &namespace);
            vars.push(env("TRIBEFIRE_IS_EXTENSION_HOST", "true"));
            vars.push(env(
                "TRIBEFIRE_LOCAL_BASE_URL",
                format!(
                    "http://{}:{HTTP_PORT}",
                    component_resource_name(runtime, component)
                ),
            ));
        }
        ComponentKind::ControlCenter
        | ComponentKind::Modeler
        | ComponentKind::Explorer
        | ComponentKind::WebReader => {}
    }

    if let Some(log_json) = component.spec.log_json.as_deref() {
        vars.push(env("JSON_LOGGING_ENABLED", log_json));
    }
    if component.spec.enable_jpda.as_deref() == Some("true") {
        vars.push(env("DEBUG_PORTS_ENABLED", "true"));
    }

    vars.extend(component.spec.env.iter().cloned());
    vars
}

fn push_processing_env(vars: &mut Vec<EnvVar>, name: &str, namespace: &str) {
    vars.push(env("TRIBEFIRE_TENANT_ID", format!("{name}-{namespace}")));
    vars.push(env("TRIBEFIRE_IS_CLUSTERED", "true"));
    vars.push(env(
        NODE_ID_VAR,
        format!("$(TF_OPERATOR_POD_ID)--$({RANDOM_VAR})"),
    ));
}

fn push_master_env(
    vars: &mut Vec<EnvVar>,
    runtime: &TribefireRuntime,
    cookie_domain: &str,
    stamp: &DeploymentStamp,
) {
    let db_secret = database_secret_name(runtime);

    vars.push(env("TRIBEFIRE_BINDING_USER_SESSIONS_DS", "user-sessions-db"));
    vars.push(env(DEPLOYMENT_TIMESTAMP_VAR, stamp.timestamp.clone()));
    vars.push(env("TRIBEFIRE_COOKIE_PATH", "/"));
    vars.push(env("TRIBEFIRE_COOKIE_DOMAIN", cookie_domain));
    vars.push(secret_env("TF_SYS_DB_USER", &db_secret, "username"));
    vars.push(secret_env("TF_SYS_DB_PASSWORD", &db_secret, "password"));

    if let Some(dcsa) = runtime.spec.dcsa.as_ref().filter(|d| d.is_enabled()) {
        if let Some(secret) = dcsa
            .credentials_secret_ref
            .as_ref()
            .and_then(|r| r.name.as_deref())
        {
            vars.push(secret_env("TF_DCSA_DB_USER", secret, "username"));
            vars.push(secret_env("TF_DCSA_DB_PASSWORD", secret, "password"));
        }
    }

    if !runtime.spec.is_local_database() {
        vars.push(env(
            "GOOGLE_APPLICATION_CREDENTIALS",
            format!("{CLOUDSQL_MOUNT_PATH}/{SERVICE_ACCOUNT_KEY}"),
        ));
    }

    for db in &runtime.spec.additional_databases {
        let secret = db.credentials_secret_ref.name.clone().unwrap_or_default();
        let url = jdbc_url(&db.instance_descriptor, db.database_name.as_deref().unwrap_or(&db.name));
        for prefix in &db.env_prefixes {
            if let Some(url) = &url {
                vars.push(env(&format!("{prefix}_DB_URL"), url.clone()));
            }
            vars.push(secret_env(&format!("{prefix}_DB_USER"), &secret, "username"));
            vars.push(secret_env(&format!("{prefix}_DB_PASS"), &secret, "password"));
            vars.push(secret_env(&format!("{prefix}_DB_PASSWORD"), &secret, "password"));
        }
    }
}

/// JDBC URL for an additional database.
///
/// JDBC descriptors pass through; a Cloud SQL descriptor such as
/// `project:region:instance=tcp:5555` points at the local proxy port.
fn jdbc_url(descriptor: &str, database: &str) -> Option<String> {
    if descriptor.starts_with("jdbc:") {
        return Some(descriptor.to_string());
    }
    let (_, proto_port) = descriptor.split_once('=')?;
    let (_, port) = proto_port.split_once(':')?;
    Some(format!("jdbc:postgresql://localhost:{port}/{database}"))
}

/// Deployment running the component
pub fn component_deployment(
    runtime: &TribefireRuntime,
    component: &Component,
    components: &[Component],
    stamp: &DeploymentStamp,
) -> Deployment {
    let app = component.app_name();
    let labels = selector_labels(runtime, &app);
    let mut pod_labels = labels.clone();
    pod_labels.extend(component.spec.labels.clone());

    let health_path = component
        .spec
        .custom_health_check_path
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| format!("{}/healthz", component.api_path()));

    let mut volumes: Vec<Volume> = component
        .spec
        .volumes
        .iter()
        .map(|v| Volume {
            name: v.name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: v.volume_claim_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();
    let mut mounts: Vec<VolumeMount> = component
        .spec
        .volumes
        .iter()
        .map(|v| VolumeMount {
            name: v.name.clone(),
            mount_path: v.volume_mount_path.clone(),
            ..Default::default()
        })
        .collect();

    if component.kind == ComponentKind::Services && !runtime.spec.is_local_database() {
        volumes.push(Volume {
            name: CLOUDSQL_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(service_account_secret_name(runtime)),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: CLOUDSQL_VOLUME.to_string(),
            mount_path: CLOUDSQL_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let container = Container {
        name: app.clone(),
        image: Some(component.image_reference()),
        image_pull_policy: Some("Always".to_string()),
        env: Some(component_env(runtime, component, components, stamp)),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: HTTP_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: component.spec.resources.clone(),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some(health_path),
                port: IntOrString::Int(HTTP_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(30),
            period_seconds: Some(10),
            ..Default::default()
        }),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    };

    Deployment {
        metadata: owned_meta(runtime, component_resource_name(runtime, component), &app),
        spec: Some(DeploymentSpec {
            replicas: Some(component.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(runtime.name_any()),
                    image_pull_secrets: Some(vec![LocalObjectReference {
                        name: image_pull_secret_name(runtime),
                    }]),
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    node_selector: (!component.spec.node_selector.is_empty())
                        .then(|| component.spec.node_selector.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP service in front of the component's pods
pub fn component_service(runtime: &TribefireRuntime, component: &Component) -> Service {
    let app = component.app_name();
    Service {
        metadata: owned_meta(runtime, component_resource_name(runtime, component), &app),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(runtime, &app)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: HTTP_PORT,
                target_port: Some(IntOrString::Int(HTTP_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ingress routing the component's API path to its service
pub fn component_ingress(runtime: &TribefireRuntime, component: &Component) -> Ingress {
    let app = component.app_name();
    let name = component_resource_name(runtime, component);
    Ingress {
        metadata: owned_meta(runtime, name.clone(), &app),
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(ingress_host(runtime, component)),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(component.api_path()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name,
                                port: Some(ServiceBackendPort {
                                    number: Some(HTTP_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// URLs served by an ingress: one per host and path
pub fn ingress_endpoints(ingress: &Ingress, scheme: &str) -> Vec<String> {
    let rules = ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut urls = Vec::new();
    for rule in rules {
        let Some(host) = rule.host.as_deref() else {
            continue;
        };
        for path in rule.http.iter().flat_map(|h| h.paths.iter()) {
            urls.push(format!(
                "{scheme}://{host}{}",
                path.path.as_deref().unwrap_or("/")
            ));
        }
    }
    urls
}
