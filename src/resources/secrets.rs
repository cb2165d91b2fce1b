//! Credential and image pull secrets

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;

use super::owned_meta;
use crate::crd::TribefireRuntime;
use crate::providers::DatabaseCredentials;

/// Key of the service account JSON inside its secret
pub const SERVICE_ACCOUNT_KEY: &str = "credentials.json";

const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
const EMPTY_DOCKER_CONFIG: &[u8] = br#"{"auths":{}}"#;

/// `<runtime>-systemdb`
pub fn database_secret_name(runtime: &TribefireRuntime) -> String {
    format!("{}-systemdb", runtime.name_any())
}

/// `<runtime>-cloudsql-credentials`
pub fn service_account_secret_name(runtime: &TribefireRuntime) -> String {
    format!("{}-cloudsql-credentials", runtime.name_any())
}

/// `<runtime>-bt-artifactory`
pub fn image_pull_secret_name(runtime: &TribefireRuntime) -> String {
    format!("{}-bt-artifactory", runtime.name_any())
}

/// Connection data for the system database
pub fn database_secret(runtime: &TribefireRuntime, credentials: &DatabaseCredentials) -> Secret {
    Secret {
        metadata: owned_meta(runtime, database_secret_name(runtime), "tribefire"),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([
            ("username".to_string(), credentials.user.clone()),
            ("password".to_string(), credentials.password.clone()),
            ("database".to_string(), credentials.database.clone()),
            ("host".to_string(), credentials.host.clone()),
        ])),
        ..Default::default()
    }
}

/// Cloud SQL service account, `json` is the content of the mounted key file
pub fn service_account_secret(runtime: &TribefireRuntime, json: Vec<u8>) -> Secret {
    Secret {
        metadata: owned_meta(runtime, service_account_secret_name(runtime), "tribefire"),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            SERVICE_ACCOUNT_KEY.to_string(),
            ByteString(json),
        )])),
        ..Default::default()
    }
}

/// Registry credentials; an empty docker config when none are configured
pub fn image_pull_secret(runtime: &TribefireRuntime, docker_config: Option<Vec<u8>>) -> Secret {
    let config = docker_config.unwrap_or_else(|| EMPTY_DOCKER_CONFIG.to_vec());
    Secret {
        metadata: owned_meta(runtime, image_pull_secret_name(runtime), "tribefire"),
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_KEY.to_string(),
            ByteString(config),
        )])),
        ..Default::default()
    }
}
