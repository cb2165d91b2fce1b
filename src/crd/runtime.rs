//! TribefireRuntime Custom Resource Definition
//!
//! A TribefireRuntime describes a multi-component application: its components,
//! the database it runs on and the messaging backend its nodes talk through.
//! The status sub-record is the only state the operator persists.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    BackendConfiguration, ComponentHealth, ComponentSpec, ComponentStatus, Condition,
    DatabaseSpec, DatabaseType, DcsaConfig, DeploymentPhase,
};

/// Domain used when the spec does not name one
pub const DEFAULT_DOMAIN: &str = "tribefire.local";

/// Specification for a TribefireRuntime
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tribefire.cloud",
    version = "v1",
    kind = "TribefireRuntime",
    plural = "tribefireruntimes",
    shortname = "tf",
    status = "TribefireRuntimeStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TribefireRuntimeSpec {
    /// Domain the runtime's ingresses are exposed under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// System database type
    #[serde(default)]
    pub database_type: DatabaseType,

    /// Additional databases exposed to the components
    #[serde(
        rename = "databases",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub additional_databases: Vec<DatabaseSpec>,

    /// Messaging backend
    #[serde(default)]
    pub backend: BackendConfiguration,

    /// Distributed shared storage configuration
    #[serde(
        rename = "dcsaConfig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dcsa: Option<DcsaConfig>,

    /// Components to deploy
    pub components: Vec<ComponentSpec>,
}

impl TribefireRuntimeSpec {
    /// Returns true if the system database runs in-cluster
    pub fn is_local_database(&self) -> bool {
        self.database_type == DatabaseType::Local
    }

    /// Domain with the default applied
    pub fn domain(&self) -> &str {
        self.domain.as_deref().unwrap_or(DEFAULT_DOMAIN)
    }
}

/// Status for a TribefireRuntime
///
/// Every field is always serialized: the status is written as a merge patch,
/// and a key left out of the patch would keep its stored value.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TribefireRuntimeStatus {
    /// True if the last sync attempt failed
    #[serde(default)]
    pub error: bool,

    /// Overall state: available, degraded or unavailable
    #[serde(rename = "status", default)]
    pub message: Option<String>,

    /// Bootstrap phase reached by the last sync
    #[serde(default)]
    pub phase: Option<DeploymentPhase>,

    /// Conditions describing the runtime as a whole
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Per-component health, recomputed on every reconciliation
    #[serde(rename = "components", default)]
    pub component_status: Vec<ComponentStatus>,

    /// Last generation the operator finished syncing
    #[serde(default)]
    pub observed_generation: i64,

    /// Set once, on the first successful sync (RFC 3339)
    #[serde(default)]
    pub created: Option<String>,

    /// Set on every sync (RFC 3339)
    #[serde(default)]
    pub updated: Option<String>,
}

impl TribefireRuntimeStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Look up a component's status by name
    pub fn component(&self, name: &str) -> Option<&ComponentStatus> {
        self.component_status.iter().find(|c| c.name == name)
    }

    /// Returns true if every component is available
    pub fn all_available(&self) -> bool {
        self.component_status
            .iter()
            .all(|c| c.status == ComponentHealth::Available)
    }
}

impl TribefireRuntime {
    /// Generation of the spec, 0 if unset
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// Generation recorded by the last completed sync, 0 if never synced
    pub fn observed_generation(&self) -> i64 {
        self.status
            .as_ref()
            .map(|s| s.observed_generation)
            .unwrap_or(0)
    }

    /// Returns true if deletion has been requested
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns true if the runtime has never completed a sync
    pub fn is_initial_sync(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.created.as_deref())
            .map_or(true, str::is_empty)
    }

    /// Namespace of the runtime; runtimes are namespaced so this is never empty
    /// for objects read from the API server
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// `stage` label, `default` if absent
    pub fn stage(&self) -> &str {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("stage"))
            .map(String::as_str)
            .unwrap_or("default")
    }
}
