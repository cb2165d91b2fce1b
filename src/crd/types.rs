//! Supporting types for the TribefireRuntime CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, SecretReference};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Database backing the runtime's system database
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// Managed Cloud SQL instance, reached through the cloudsql proxy
    #[serde(rename = "cloudsql")]
    CloudSql,
    /// In-cluster PostgreSQL
    #[default]
    Local,
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CloudSql => write!(f, "cloudsql"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Messaging backend used by the runtime's components
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessagingBackend {
    /// Externally managed etcd
    #[default]
    Etcd,
    /// Legacy ActiveMQ, deployed by the operator
    #[serde(rename = "activemq")]
    ActiveMq,
}

impl MessagingBackend {
    /// Condition type reporting this backend's health
    pub fn condition_type(&self) -> &'static str {
        match self {
            Self::Etcd => "EtcdAvailable",
            Self::ActiveMq => "BackendAvailable",
        }
    }
}

impl std::fmt::Display for MessagingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Etcd => write!(f, "etcd"),
            Self::ActiveMq => write!(f, "activemq"),
        }
    }
}

/// Name/value parameter passed to the messaging backend
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct BackendParam {
    /// Parameter name (e.g. `url`)
    pub name: String,
    /// Parameter value
    pub value: String,
}

impl BackendParam {
    /// Create a parameter
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Messaging backend configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct BackendConfiguration {
    /// Backend type
    #[serde(rename = "type", default)]
    pub type_: MessagingBackend,

    /// Backend parameters
    #[serde(rename = "parameters", default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<BackendParam>,
}

impl BackendConfiguration {
    /// Look up a parameter value by name
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

/// Additional database made available to the runtime's components
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Logical name
    pub name: String,

    /// Database type
    #[serde(rename = "type")]
    pub type_: DatabaseType,

    /// Instance descriptor, e.g. a JDBC URL or Cloud SQL connection name
    pub instance_descriptor: String,

    /// Environment variable prefixes under which connection data is exposed
    #[serde(default)]
    pub env_prefixes: Vec<String>,

    /// Database name on the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,

    /// Secret holding the credentials
    pub credentials_secret_ref: SecretReference,
}

/// Distributed shared storage configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DcsaConfig {
    /// Instance descriptor of the shared storage database
    #[serde(default)]
    pub instance_descriptor: String,

    /// Secret holding the credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_ref: Option<SecretReference>,
}

impl DcsaConfig {
    /// Returns true if shared storage is configured
    pub fn is_enabled(&self) -> bool {
        !self.instance_descriptor.is_empty()
            && self
                .credentials_secret_ref
                .as_ref()
                .and_then(|r| r.name.as_deref())
                .is_some_and(|n| !n.is_empty())
    }
}

/// Persistent volume mounted into a component
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TribefireVolume {
    /// Volume name
    pub name: String,
    /// Name of an existing PersistentVolumeClaim
    pub volume_claim_name: String,
    /// Mount path inside the container
    pub volume_mount_path: String,
}

/// Desired state of one deployable component of a runtime
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Component name, unique within the runtime
    pub name: String,

    /// Component type: services, control-center, modeler, explorer,
    /// web-reader or cartridge
    #[serde(rename = "type")]
    pub type_: String,

    /// Container image without tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Container image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    /// Log level: SEVERE, WARNING, INFO, CONFIG, FINE, FINER, FINEST
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Path under which the component is exposed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_path: Option<String>,

    /// Number of replicas (1-10)
    #[serde(default)]
    pub replicas: i32,

    /// Externally visible URL, overrides the ingress-derived one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    /// Additional environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Log in JSON format ("true"/"false")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_json: Option<String>,

    /// Resource requests and limits of the primary container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Additional labels for the component's resources
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Protocol of the public URL (http/https)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Persistent volumes to mount
    #[serde(
        rename = "persistentVolumes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub volumes: Vec<TribefireVolume>,

    /// Enable remote debugging ("true"/"false")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_jpda: Option<String>,

    /// Health check path overriding the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_health_check_path: Option<String>,

    /// Node selector for the component's pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// Health of a single component, derived from its deployment's replica counts
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComponentHealth {
    /// All desired replicas are available
    Available,
    /// Some replicas are available, some are not
    Degraded,
    /// No replica is available, or the deployment does not exist
    #[default]
    Unavailable,
}

impl std::fmt::Display for ComponentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Observed state of one component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ComponentStatus {
    /// Component name
    pub name: String,

    /// Derived health
    pub status: ComponentHealth,

    /// Externally reachable endpoint URLs
    #[serde(rename = "urls", default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
}

/// How far a runtime's bootstrap has progressed
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentPhase {
    /// Spec defaulting and validation
    TribefireValidation,
    /// System database provisioning
    DatabaseBootstrap,
    /// Credential and pull secrets
    SecretBootstrap,
    /// Service account, role and role binding
    RbacBootstrap,
    /// Component deployments, services and ingresses
    ComponentDeployment,
    /// Messaging backend
    BackendBootstrap,
    /// Everything is deployed
    TribefireRunning,
}

impl DeploymentPhase {
    /// Phase name as written to status and used as event reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TribefireValidation => "TribefireValidation",
            Self::DatabaseBootstrap => "DatabaseBootstrap",
            Self::SecretBootstrap => "SecretBootstrap",
            Self::RbacBootstrap => "RbacBootstrap",
            Self::ComponentDeployment => "ComponentDeployment",
            Self::BackendBootstrap => "BackendBootstrap",
            Self::TribefireRunning => "TribefireRunning",
        }
    }
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition describing the runtime as a whole
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Available, Progressing, EtcdAvailable, ...)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition was written
    pub last_update_time: DateTime<Utc>,

    /// Last time the status value flipped
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_update_time: now,
            last_transition_time: now,
        }
    }
}

/// Insert or update `condition` in `conditions`, keyed by type.
///
/// At most one condition per type exists afterwards. The transition timestamp
/// of an existing entry only moves when its status flips; reason, message and
/// update timestamp are always refreshed. Returns true if the status flipped or
/// the condition was added.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let flipped = existing.status != condition.status;
            if flipped {
                existing.status = condition.status;
                existing.last_transition_time = condition.last_update_time;
            }
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.last_update_time = condition.last_update_time;
            flipped
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    mod wire_format {
        use super::*;

        #[test]
        fn database_type_uses_lowercase_names() {
            assert_eq!(
                serde_json::to_string(&DatabaseType::CloudSql).unwrap(),
                "\"cloudsql\""
            );
            let local: DatabaseType = serde_json::from_str("\"local\"").unwrap();
            assert_eq!(local, DatabaseType::Local);
        }

        #[test]
        fn backend_defaults_to_etcd() {
            let backend: BackendConfiguration = serde_json::from_str("{}").unwrap();
            assert_eq!(backend.type_, MessagingBackend::Etcd);
            let amq: BackendConfiguration =
                serde_json::from_str(r#"{"type":"activemq"}"#).unwrap();
            assert_eq!(amq.type_, MessagingBackend::ActiveMq);
        }

        #[test]
        fn component_status_serializes_urls() {
            let status = ComponentStatus {
                name: "master".to_string(),
                status: ComponentHealth::Degraded,
                endpoints: vec!["https://demo-ns.tribefire.local/services".to_string()],
            };
            let json = serde_json::to_value(&status).unwrap();
            assert_eq!(json["status"], "degraded");
            assert_eq!(json["urls"][0], "https://demo-ns.tribefire.local/services");
        }

        #[test]
        fn component_spec_reads_persistent_volumes() {
            let spec: ComponentSpec = serde_json::from_str(
                r#"{"name":"master","type":"services","persistentVolumes":[
                    {"name":"data","volumeClaimName":"pvc-data","volumeMountPath":"/data"}]}"#,
            )
            .unwrap();
            assert_eq!(spec.volumes.len(), 1);
            assert_eq!(spec.volumes[0].volume_claim_name, "pvc-data");
            assert_eq!(spec.replicas, 0);
        }
    }

    mod backend {
        use super::*;

        #[test]
        fn condition_type_depends_on_backend() {
            assert_eq!(MessagingBackend::Etcd.condition_type(), "EtcdAvailable");
            assert_eq!(MessagingBackend::ActiveMq.condition_type(), "BackendAvailable");
        }

        #[test]
        fn param_lookup_by_name() {
            let cfg = BackendConfiguration {
                type_: MessagingBackend::Etcd,
                params: vec![BackendParam::new("url", "http://etcd:2379")],
            };
            assert_eq!(cfg.param("url"), Some("http://etcd:2379"));
            assert_eq!(cfg.param("user"), None);
        }

        #[test]
        fn dcsa_needs_descriptor_and_secret() {
            let mut dcsa = DcsaConfig {
                instance_descriptor: "jdbc:postgresql://db/dcsa".to_string(),
                credentials_secret_ref: None,
            };
            assert!(!dcsa.is_enabled());
            dcsa.credentials_secret_ref = Some(SecretReference {
                name: Some("dcsa-creds".to_string()),
                namespace: None,
            });
            assert!(dcsa.is_enabled());
        }
    }

    mod conditions {
        use super::*;

        fn aged(mut c: Condition, hours: i64) -> Condition {
            c.last_transition_time -= Duration::hours(hours);
            c.last_update_time -= Duration::hours(hours);
            c
        }

        #[test]
        fn new_condition_is_appended() {
            let mut conditions = Vec::new();
            let flipped = set_condition(
                &mut conditions,
                Condition::new("Available", ConditionStatus::True, "ComponentsAvailable", "ok"),
            );
            assert!(flipped);
            assert_eq!(conditions.len(), 1);
        }

        #[test]
        fn same_status_keeps_transition_time_but_refreshes_message() {
            let original = aged(
                Condition::new("Available", ConditionStatus::True, "ComponentsAvailable", "old"),
                2,
            );
            let transition = original.last_transition_time;
            let mut conditions = vec![original];

            let flipped = set_condition(
                &mut conditions,
                Condition::new("Available", ConditionStatus::True, "ComponentsAvailable", "new"),
            );

            assert!(!flipped);
            assert_eq!(conditions.len(), 1);
            assert_eq!(conditions[0].message, "new");
            assert_eq!(conditions[0].last_transition_time, transition);
            assert!(conditions[0].last_update_time > transition);
        }

        #[test]
        fn status_flip_moves_transition_time() {
            let original = aged(
                Condition::new("Available", ConditionStatus::True, "ComponentsAvailable", "ok"),
                2,
            );
            let transition = original.last_transition_time;
            let mut conditions = vec![original];

            let flipped = set_condition(
                &mut conditions,
                Condition::new("Available", ConditionStatus::False, "ComponentsDegraded", "x"),
            );

            assert!(flipped);
            assert_eq!(conditions[0].status, ConditionStatus::False);
            assert!(conditions[0].last_transition_time > transition);
            assert_eq!(conditions[0].reason, "ComponentsDegraded");
        }

        #[test]
        fn distinct_types_coexist() {
            let mut conditions = Vec::new();
            set_condition(
                &mut conditions,
                Condition::new("Available", ConditionStatus::True, "a", "a"),
            );
            set_condition(
                &mut conditions,
                Condition::new("EtcdAvailable", ConditionStatus::False, "b", "b"),
            );
            set_condition(
                &mut conditions,
                Condition::new("Available", ConditionStatus::True, "a", "a"),
            );
            assert_eq!(conditions.len(), 2);
        }
    }

    #[test]
    fn condition_status_from_bool() {
        assert_eq!(ConditionStatus::from(true), ConditionStatus::True);
        assert_eq!(ConditionStatus::from(false), ConditionStatus::False);
    }
}
