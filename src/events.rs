//! Kubernetes Event recording for the runtime controller.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so the reconciler
//! can emit the lifecycle events visible via `kubectl describe tf <name>`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Trait for publishing Kubernetes Events.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on the given object.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (e.g. "ComponentScaled")
    /// * `action` - What was being done (e.g. "Sync")
    /// * `note` - Human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`.
///
/// Bootstrap steps use their [`DeploymentPhase`](crate::crd::DeploymentPhase)
/// name as reason.
pub mod reasons {
    /// Deletion observed, cleanup starting
    pub const RUNTIME_FINALIZING: &str = "TribefireRuntimeFinalizing";
    /// Finalizer removed
    pub const RUNTIME_FINALIZED: &str = "TribefireRuntimeFinalized";
    /// Full sync finished
    pub const RUNTIME_RECONCILED: &str = "TribefireRuntimeReconciled";

    /// Replica count changed
    pub const COMPONENT_SCALED: &str = "ComponentScaled";
    /// Environment variable added or changed
    pub const ENVIRONMENT_CHANGED: &str = "EnvironmentChanged";
    /// Image or tag changed
    pub const IMAGE_CHANGED: &str = "ImageChanged";
    /// Requests or limits changed
    pub const RESOURCES_CHANGED: &str = "ResourcesChanged";
    /// Log level changed
    pub const LOG_LEVEL_CHANGED: &str = "LogLevelChanged";

    /// Component became available
    pub const COMPONENT_AVAILABLE: &str = "ComponentAvailable";
    /// Component became unavailable
    pub const COMPONENT_UNAVAILABLE: &str = "ComponentUnavailable";
    /// Component became degraded
    pub const COMPONENT_DEGRADED: &str = "ComponentDegraded";
    /// Component endpoints changed
    pub const COMPONENT_URL_CHANGED: &str = "ComponentUrlChanged";

    /// Messaging backend probe failed
    pub const BACKEND_UNAVAILABLE: &str = "BackendUnavailable";
}

/// Event actions, shown in the ACTION column of `kubectl get events`.
pub mod actions {
    /// Bootstrapping or updating owned resources
    pub const SYNC: &str = "Sync";
    /// Recomputing health
    pub const STATUS: &str = "Status";
    /// Cleanup before deletion
    pub const FINALIZE: &str = "Finalize";
}
