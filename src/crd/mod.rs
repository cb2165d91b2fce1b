//! Custom Resource Definitions for the Tribefire operator
//!
//! This module contains the TribefireRuntime CRD, its supporting types and the
//! defaulting applied before a runtime is synced.

mod component;
mod defaults;
mod runtime;
mod types;

pub use component::{Component, ComponentKind};
pub use defaults::{
    apply_defaults, DEFAULT_ETCD_URL, DEFAULT_IMAGE_TAG, DEFAULT_LOG_LEVEL, LOG_LEVELS,
    MAX_REPLICAS,
};
pub use runtime::{TribefireRuntime, TribefireRuntimeSpec, TribefireRuntimeStatus, DEFAULT_DOMAIN};
pub use types::{
    set_condition, BackendConfiguration, BackendParam, ComponentHealth, ComponentSpec,
    ComponentStatus, Condition, ConditionStatus, DatabaseSpec, DatabaseType, DcsaConfig,
    DeploymentPhase, MessagingBackend, TribefireVolume,
};
