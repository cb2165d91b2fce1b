//! OpenTelemetry metrics for the runtime controller
//!
//! Counters are created lazily from the global meter. Without an exporter
//! configured the global provider is a no-op.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

/// Global meter for operator metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("tribefire-operator"));

/// Counter of reconcile invocations
pub static RECONCILE_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("tribefire_reconcile_total")
        .with_description("Total number of runtime reconciliations")
        .with_unit("{reconciliations}")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `origin`: step that failed, e.g. `database.create`, `resource.update`
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("tribefire_reconcile_errors_total")
        .with_description("Total number of runtime reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of persisted status updates
pub static STATUS_UPDATES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("tribefire_status_updates_total")
        .with_description("Total number of runtime status updates written")
        .with_unit("{updates}")
        .build()
});

/// Error origins used as the `origin` label
pub mod origins {
    /// Reading the runtime failed
    pub const GENERAL: &str = "general";
    /// Reading the runtime, or re-reading it before release, failed
    pub const RESOURCE_QUERY: &str = "resource.query";
    /// Releasing the finalizer failed
    pub const RESOURCE_UPDATE: &str = "resource.update";
    /// Adding the finalizer failed
    pub const CLIENT_UPDATE: &str = "Client.Update";
    /// Defaulting or validation failed
    pub const SPEC_VALIDATE: &str = "spec.validate";
    /// Database provisioning failed
    pub const DATABASE_CREATE: &str = "database.create";
    /// Database secret creation failed
    pub const DATABASE_SECRETS_CREATE: &str = "database.secrets.create";
    /// Service account secret creation failed
    pub const DATABASE_SERVICE_ACCOUNT_CREATE: &str = "database.serviceaccount.create";
    /// Image pull secret creation failed
    pub const IMAGE_PULL_SECRET_CREATE: &str = "image.pullsecret.create";
    /// Service account creation failed
    pub const RBAC_SERVICE_ACCOUNT_CREATE: &str = "rbac.serviceaccount.create";
    /// Role creation failed
    pub const RBAC_ROLE_CREATE: &str = "rbac.role.create";
    /// Role binding creation failed
    pub const RBAC_ROLE_BINDING_CREATE: &str = "rbac.rolebinding.create";
    /// Messaging backend creation failed
    pub const MESSAGING_CREATE: &str = "components.messaging.create";
    /// Status update failed or did not converge
    pub const STATUS_UPDATE: &str = "status.update";
}

/// Count one reconcile invocation
pub fn record_reconcile() {
    RECONCILE_TOTAL.add(1, &[]);
}

/// Count one error for the given origin
pub fn record_error(origin: &str) {
    RECONCILE_ERRORS.add(1, &[KeyValue::new("origin", origin.to_string())]);
}

/// Count one persisted status update
pub fn record_status_update() {
    STATUS_UPDATES.add(1, &[]);
}
