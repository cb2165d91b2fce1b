//! Tribefire operator - reconciles TribefireRuntime resources into running
//! Kubernetes workloads
//!
//! A TribefireRuntime describes one Tribefire installation: a set of
//! components (master services, control center, modeler, explorer, web reader
//! and cartridges), a system database and a messaging backend. The operator
//! provisions the supporting objects, keeps the component deployments in line
//! with the spec and reports health back on the runtime's status.
//!
//! # Modules
//!
//! - [`crd`] - TribefireRuntime custom resource and defaulting rules
//! - [`controller`] - Reconciliation state machine and its stages
//! - [`resources`] - Builders for the Kubernetes objects owned by a runtime
//! - [`store`] - Kubernetes API access behind a mockable trait
//! - [`providers`] - System database provisioning and messaging health probes
//! - [`events`] - Kubernetes event publishing
//! - [`metrics`] - OpenTelemetry counters for reconciles and failures
//! - [`telemetry`] - Logging and OTLP export setup
//! - [`config`] - Reconciler tuning knobs
//! - [`retry`] - Bounded retry and polling helpers
//! - [`quantity`] - Resource quantity comparison
//! - [`error`] - Error types for the operator

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod providers;
pub mod quantity;
pub mod resources;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
