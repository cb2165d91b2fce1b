//! In-memory collaborators for controller tests
//!
//! [`FakeStore`] keeps one runtime plus the objects created for it and records
//! every write, so tests assert on outcomes instead of on call expectations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::networking::v1::Ingress;
use kube::core::ErrorResponse;
use kube::runtime::events::EventType;
use kube::ResourceExt;

use super::Context;
use crate::crd::{TribefireRuntime, TribefireRuntimeStatus};
use crate::events::EventPublisher;
use crate::providers::{LocalDatabaseProvisioner, MockBackendHealthChecker};
use crate::store::{CreateOutcome, ManagedResource, RuntimeStore};
use crate::Error;

fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

/// Apply `patch` to `target` the way a JSON merge patch (RFC 7386) does
fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let serde_json::Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(Default::default());
    }
    let target = target.as_object_mut().unwrap();
    for (key, value) in fields {
        if value.is_null() {
            target.remove(key);
        } else {
            merge_patch(target.entry(key.clone()).or_insert(serde_json::Value::Null), value);
        }
    }
}

#[derive(Default)]
struct State {
    runtime: Option<TribefireRuntime>,
    existing: BTreeSet<(String, String)>,
    created: Vec<(String, String)>,
    deployments: BTreeMap<String, Deployment>,
    ingresses: BTreeMap<String, Ingress>,
    deployment_updates: Vec<Deployment>,
    ingress_updates: Vec<Ingress>,
    status_writes: Vec<TribefireRuntimeStatus>,
    finalizer_writes: usize,
    runtime_reads: usize,
    ingress_reads: usize,
    calls: Vec<String>,
    hide_status_writes: bool,
    fail_finalizer_writes: bool,
    fail_creates: BTreeSet<String>,
}

/// In-memory [`RuntimeStore`] that records writes
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<State>>,
}

impl FakeStore {
    /// Store holding `runtime`
    pub fn with_runtime(runtime: TribefireRuntime) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().runtime = Some(runtime);
        store
    }

    /// Store holding nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Current stored runtime
    pub fn runtime(&self) -> Option<TribefireRuntime> {
        self.state.lock().unwrap().runtime.clone()
    }

    /// Replace the stored runtime
    pub fn set_runtime(&self, runtime: TribefireRuntime) {
        self.state.lock().unwrap().runtime = Some(runtime);
    }

    /// Put a live deployment, e.g. with replica status filled in
    pub fn put_deployment(&self, name: &str, deployment: Deployment) {
        let mut state = self.state.lock().unwrap();
        state
            .existing
            .insert(("Deployment".to_string(), name.to_string()));
        state.deployments.insert(name.to_string(), deployment);
    }

    /// Put a live ingress
    pub fn put_ingress(&self, name: &str, ingress: Ingress) {
        let mut state = self.state.lock().unwrap();
        state
            .existing
            .insert(("Ingress".to_string(), name.to_string()));
        state.ingresses.insert(name.to_string(), ingress);
    }

    /// Mark every stored deployment as fully available
    pub fn roll_out_all(&self) {
        let mut state = self.state.lock().unwrap();
        for deployment in state.deployments.values_mut() {
            let replicas = deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1);
            let status = deployment.status.get_or_insert_with(Default::default);
            status.replicas = Some(replicas);
            status.available_replicas = Some(replicas);
            status.unavailable_replicas = None;
        }
    }

    /// Status writes succeed but never become visible
    pub fn hide_status_writes(&self) {
        self.state.lock().unwrap().hide_status_writes = true;
    }

    /// Finalizer writes fail with a conflict
    pub fn fail_finalizer_writes(&self) {
        self.state.lock().unwrap().fail_finalizer_writes = true;
    }

    /// Creating an object of `kind` fails with a server error
    pub fn fail_creates_of(&self, kind: &str) {
        self.state.lock().unwrap().fail_creates.insert(kind.to_string());
    }

    /// `(kind, name)` of every object actually created, in order
    pub fn created(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created.clone()
    }

    /// Deployments written back by drift reconciliation
    pub fn deployment_updates(&self) -> Vec<Deployment> {
        self.state.lock().unwrap().deployment_updates.clone()
    }

    /// Ingresses written back by sync
    pub fn ingress_updates(&self) -> Vec<Ingress> {
        self.state.lock().unwrap().ingress_updates.clone()
    }

    /// Every status written, visible or not
    pub fn status_writes(&self) -> Vec<TribefireRuntimeStatus> {
        self.state.lock().unwrap().status_writes.clone()
    }

    /// Number of finalizer writes
    pub fn finalizer_writes(&self) -> usize {
        self.state.lock().unwrap().finalizer_writes
    }

    /// Number of runtime reads
    pub fn runtime_reads(&self) -> usize {
        self.state.lock().unwrap().runtime_reads
    }

    /// Number of ingress reads
    pub fn ingress_reads(&self) -> usize {
        self.state.lock().unwrap().ingress_reads
    }

    /// Every write call in order, as `op kind/name`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl RuntimeStore for FakeStore {
    async fn get_runtime(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<TribefireRuntime>, Error> {
        let mut state = self.state.lock().unwrap();
        state.runtime_reads += 1;
        Ok(state.runtime.clone())
    }

    async fn update_finalizers(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_finalizer_writes {
            return Err(api_error(409, "Conflict"));
        }
        state.finalizer_writes += 1;
        state
            .calls
            .push(format!("finalizers TribefireRuntime/{}", runtime.name_any()));
        if let Some(stored) = state.runtime.as_mut() {
            stored.metadata.finalizers = runtime.metadata.finalizers.clone();
        }
        Ok(())
    }

    async fn update_status(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let status = runtime.status.clone().unwrap_or_default();
        state.status_writes.push(status.clone());
        state
            .calls
            .push(format!("status TribefireRuntime/{}", runtime.name_any()));
        if !state.hide_status_writes {
            if let Some(stored) = state.runtime.as_mut() {
                // same merge the API server applies to a status merge patch
                let mut merged = serde_json::to_value(&stored.status).unwrap();
                merge_patch(&mut merged, &serde_json::to_value(&status).unwrap());
                stored.status = serde_json::from_value(merged).unwrap();
            }
        }
        Ok(())
    }

    async fn create(&self, resource: &ManagedResource) -> Result<CreateOutcome, Error> {
        let mut state = self.state.lock().unwrap();
        let key = (resource.kind().to_string(), resource.name());
        state.calls.push(format!("create {}/{}", key.0, key.1));
        if state.fail_creates.contains(&key.0) {
            return Err(api_error(500, "InternalError"));
        }
        if !state.existing.insert(key.clone()) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        match resource {
            ManagedResource::Deployment(d) => {
                state.deployments.insert(key.1.clone(), d.clone());
            }
            ManagedResource::Ingress(i) => {
                state.ingresses.insert(key.1.clone(), i.clone());
            }
            _ => {}
        }
        state.created.push(key);
        Ok(CreateOutcome::Created)
    }

    async fn get_deployment(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(self.state.lock().unwrap().deployments.get(name).cloned())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let name = deployment.name_any();
        state.calls.push(format!("update Deployment/{name}"));
        state.deployment_updates.push(deployment.clone());
        state.deployments.insert(name, deployment.clone());
        Ok(())
    }

    async fn get_ingress(&self, _namespace: &str, name: &str) -> Result<Option<Ingress>, Error> {
        let mut state = self.state.lock().unwrap();
        state.ingress_reads += 1;
        Ok(state.ingresses.get(name).cloned())
    }

    async fn update_ingress(&self, ingress: &Ingress) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let name = ingress.name_any();
        state.calls.push(format!("update Ingress/{name}"));
        state.ingress_updates.push(ingress.clone());
        state.ingresses.insert(name, ingress.clone());
        Ok(())
    }

    async fn delete_deployment(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete Deployment/{name}"));
        state.deployments.remove(name);
        state.existing.remove(&("Deployment".to_string(), name.to_string()));
        Ok(())
    }
}

/// A published event
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    /// Normal or Warning
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event note
    pub note: Option<String>,
}

/// [`EventPublisher`] that records every event
#[derive(Clone, Default)]
pub struct EventCapture {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl EventCapture {
    /// Empty capture
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded event in order
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Reasons of every recorded event in order
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    /// Notes of every recorded event with the given reason
    pub fn notes_for(&self, reason: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .filter_map(|e| e.note)
            .collect()
    }

    /// Returns true if any warning was recorded
    pub fn has_warning(&self) -> bool {
        self.events().iter().any(|e| e.warning)
    }
}

#[async_trait]
impl EventPublisher for EventCapture {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

/// Context over `store` and `events` with a shared local database, a healthy
/// backend and zero retries
pub fn test_context(store: FakeStore, events: EventCapture) -> Context {
    let mut backend = MockBackendHealthChecker::new();
    backend.expect_check().returning(|_| Ok(()));
    Context::for_testing(
        Arc::new(store),
        Arc::new(LocalDatabaseProvisioner::new(
            "tribefire-postgres:5432",
            "postgres",
            "postgres",
        )),
        Arc::new(backend),
        Arc::new(events),
    )
}
