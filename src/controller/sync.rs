//! Ordered bootstrap of everything a runtime needs
//!
//! database -> secrets -> RBAC -> components -> messaging backend -> status.
//! Every step tolerates objects that already exist, so a failed pass is
//! simply retried from the top. Nothing is rolled back.

use std::path::Path;

use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use super::drift::reconcile_drift;
use super::status::StatusSynchronizer;
use super::Context;
use crate::crd::{apply_defaults, Component, DeploymentPhase, MessagingBackend, TribefireRuntime};
use crate::events::actions;
use crate::metrics::{self, origins};
use crate::providers::DatabaseCredentials;
use crate::resources::{
    activemq_deployment, activemq_service, component_deployment, component_ingress,
    component_resource_name, component_service, database_secret, image_pull_secret, role,
    role_binding, service_account, service_account_secret, DeploymentStamp,
};
use crate::store::{CreateOutcome, ManagedResource};
use crate::Error;

async fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path)
        .await
        .map_err(|source| Error::local_io(path, source))
}

/// Runs one full sync pass for a runtime
pub struct SpecSyncEngine<'a> {
    ctx: &'a Context,
}

impl<'a> SpecSyncEngine<'a> {
    /// Engine working through `ctx`
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Default the spec, bring every owned object up to date and refresh
    /// status. Stops at the first failing step.
    #[instrument(skip_all, fields(runtime = %runtime.name_any(), namespace = %runtime.namespace_or_default()))]
    pub async fn sync(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        let mut runtime = runtime.clone();
        let components = match apply_defaults(&mut runtime.spec, &self.ctx.config.image_registry) {
            Ok(components) => components,
            Err(e) => {
                return Err(self
                    .fail(&runtime, DeploymentPhase::TribefireValidation, origins::SPEC_VALIDATE, "Invalid runtime spec", e)
                    .await)
            }
        };

        let credentials = self.bootstrap_database(&runtime).await?;
        self.bootstrap_secrets(&runtime, &credentials).await?;
        self.bootstrap_rbac(&runtime).await?;
        self.deploy_components(&runtime, &components).await?;
        self.bootstrap_backend(&runtime).await?;

        StatusSynchronizer::new(self.ctx)
            .sync(&runtime, Some(DeploymentPhase::TribefireRunning))
            .await
    }

    /// Report a failed step: error metric, warning event and status. Returns
    /// the error for propagation.
    async fn fail(
        &self,
        runtime: &TribefireRuntime,
        phase: DeploymentPhase,
        origin: &str,
        what: &str,
        error: Error,
    ) -> Error {
        metrics::record_error(origin);
        self.ctx
            .events
            .publish(
                &runtime.object_ref(&()),
                EventType::Warning,
                phase.as_str(),
                actions::SYNC,
                Some(format!("{what}: {error}")),
            )
            .await;
        if let Err(e) = StatusSynchronizer::new(self.ctx)
            .record_failure(runtime, phase)
            .await
        {
            debug!(error = %e, "failed to record sync failure in status");
        }
        error
    }

    async fn announce(&self, runtime: &TribefireRuntime, phase: DeploymentPhase, note: String) {
        info!(phase = %phase, "{note}");
        self.ctx
            .events
            .publish(
                &runtime.object_ref(&()),
                EventType::Normal,
                phase.as_str(),
                actions::SYNC,
                Some(note),
            )
            .await;
    }

    /// Create `resource`, reporting a failure under `phase` and `origin`
    async fn create(
        &self,
        runtime: &TribefireRuntime,
        resource: ManagedResource,
        phase: DeploymentPhase,
        origin: &str,
    ) -> Result<CreateOutcome, Error> {
        debug!(kind = resource.kind(), name = %resource.name(), "creating");
        match self.ctx.store.create(&resource).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let what = format!("Failed to create {} {}", resource.kind(), resource.name());
                Err(self.fail(runtime, phase, origin, &what, e).await)
            }
        }
    }

    async fn bootstrap_database(
        &self,
        runtime: &TribefireRuntime,
    ) -> Result<DatabaseCredentials, Error> {
        let phase = DeploymentPhase::DatabaseBootstrap;
        let (credentials, outcome) = match self.ctx.database.create_database(runtime).await {
            Ok(created) => created,
            Err(e) => {
                return Err(self
                    .fail(runtime, phase, origins::DATABASE_CREATE, "Failed to create database", e)
                    .await)
            }
        };
        if outcome.is_created() {
            self.announce(runtime, phase, format!("Created database {}", credentials.database))
                .await;
        }
        Ok(credentials)
    }

    async fn bootstrap_secrets(
        &self,
        runtime: &TribefireRuntime,
        credentials: &DatabaseCredentials,
    ) -> Result<(), Error> {
        let phase = DeploymentPhase::SecretBootstrap;

        let secret = ManagedResource::Secret(database_secret(runtime, credentials));
        if self
            .create(runtime, secret, phase, origins::DATABASE_SECRETS_CREATE)
            .await?
            .is_created()
        {
            self.announce(runtime, phase, "Created database secret".to_string())
                .await;
        }

        if !runtime.spec.is_local_database() {
            let origin = origins::DATABASE_SERVICE_ACCOUNT_CREATE;
            let json = match read_file(&self.ctx.config.service_account_file).await {
                Ok(json) => json,
                Err(e) => {
                    return Err(self
                        .fail(runtime, phase, origin, "Failed to read service account", e)
                        .await)
                }
            };
            let secret = ManagedResource::Secret(service_account_secret(runtime, json));
            if self.create(runtime, secret, phase, origin).await?.is_created() {
                self.announce(runtime, phase, "Created database service account".to_string())
                    .await;
            }
        }

        let origin = origins::IMAGE_PULL_SECRET_CREATE;
        let docker_config = match &self.ctx.config.image_pull_secret_file {
            Some(path) => match read_file(path).await {
                Ok(config) => Some(config),
                Err(e) => {
                    return Err(self
                        .fail(runtime, phase, origin, "Failed to read image pull secret", e)
                        .await)
                }
            },
            None => None,
        };
        let secret = ManagedResource::Secret(image_pull_secret(runtime, docker_config));
        if self.create(runtime, secret, phase, origin).await?.is_created() {
            self.announce(runtime, phase, "Created image pull secret".to_string())
                .await;
        }
        Ok(())
    }

    async fn bootstrap_rbac(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        let phase = DeploymentPhase::RbacBootstrap;
        let steps = [
            (
                ManagedResource::ServiceAccount(service_account(runtime)),
                origins::RBAC_SERVICE_ACCOUNT_CREATE,
            ),
            (ManagedResource::Role(role(runtime)), origins::RBAC_ROLE_CREATE),
            (
                ManagedResource::RoleBinding(role_binding(runtime)),
                origins::RBAC_ROLE_BINDING_CREATE,
            ),
        ];

        let mut created = false;
        for (resource, origin) in steps {
            created |= self.create(runtime, resource, phase, origin).await?.is_created();
        }
        if created {
            self.announce(runtime, phase, "Created RBAC resources".to_string())
                .await;
        }
        Ok(())
    }

    async fn deploy_components(
        &self,
        runtime: &TribefireRuntime,
        components: &[Component],
    ) -> Result<(), Error> {
        let phase = DeploymentPhase::ComponentDeployment;
        let stamp = DeploymentStamp::generate();

        let mut created = Vec::new();
        for component in components {
            let origin = format!("components.{}.create", component.kind.short_name());
            match self.deploy_component(runtime, component, components, &stamp).await {
                Ok(true) => created.push(component.name().to_string()),
                Ok(false) => {}
                Err(e) => {
                    let what = format!("Failed to deploy component {}", component.name());
                    return Err(self.fail(runtime, phase, &origin, &what, e).await);
                }
            }
        }

        if !created.is_empty() {
            self.announce(runtime, phase, format!("Deployed components {}", created.join(", ")))
                .await;
        }
        Ok(())
    }

    /// Create or update one component's deployment, service and ingress.
    /// Returns true if its deployment was newly created.
    #[instrument(skip_all, fields(component = %component.name()))]
    async fn deploy_component(
        &self,
        runtime: &TribefireRuntime,
        component: &Component,
        components: &[Component],
        stamp: &DeploymentStamp,
    ) -> Result<bool, Error> {
        let store = &self.ctx.store;
        let namespace = runtime.namespace_or_default();
        let name = component_resource_name(runtime, component);

        let desired = component_deployment(runtime, component, components, stamp);
        let outcome = store
            .create(&ManagedResource::Deployment(desired.clone()))
            .await?;
        if outcome == CreateOutcome::AlreadyExists {
            match store.get_deployment(&namespace, &name).await? {
                Some(live) => {
                    reconcile_drift(self.ctx, runtime, component, live, &desired).await?;
                }
                None => debug!(deployment = %name, "deployment vanished, recreated next pass"),
            }
        }

        store
            .create(&ManagedResource::Service(component_service(runtime, component)))
            .await?;

        if component.kind.has_ingress() {
            let ingress = component_ingress(runtime, component);
            if store
                .create(&ManagedResource::Ingress(ingress.clone()))
                .await?
                == CreateOutcome::AlreadyExists
            {
                self.refresh_ingress(&namespace, &name, ingress).await?;
            }
        }

        Ok(outcome.is_created())
    }

    /// Replace a live ingress whose rules differ from `desired`
    async fn refresh_ingress(
        &self,
        namespace: &str,
        name: &str,
        mut desired: Ingress,
    ) -> Result<(), Error> {
        let Some(live) = self.ctx.store.get_ingress(namespace, name).await? else {
            return Ok(());
        };
        // keep what admission filled in, e.g. the default ingress class
        if let (Some(want), Some(have)) = (desired.spec.as_mut(), live.spec.as_ref()) {
            if want.ingress_class_name.is_none() {
                want.ingress_class_name = have.ingress_class_name.clone();
            }
        }
        if live.spec == desired.spec {
            return Ok(());
        }
        desired.metadata.resource_version = live.metadata.resource_version.clone();
        self.ctx.store.update_ingress(&desired).await?;
        info!(ingress = %name, "updated ingress");
        Ok(())
    }

    async fn bootstrap_backend(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        let phase = DeploymentPhase::BackendBootstrap;
        match runtime.spec.backend.type_ {
            // externally managed
            MessagingBackend::Etcd => Ok(()),
            MessagingBackend::ActiveMq => {
                let origin = origins::MESSAGING_CREATE;
                let deployment = ManagedResource::Deployment(activemq_deployment(
                    runtime,
                    &self.ctx.config.image_registry,
                ));
                let service = ManagedResource::Service(activemq_service(runtime));
                let created = self.create(runtime, deployment, phase, origin).await?.is_created();
                self.create(runtime, service, phase, origin).await?;
                if created {
                    self.announce(runtime, phase, "Created ActiveMQ backend".to_string())
                        .await;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{test_context, EventCapture, FakeStore};
    use crate::crd::{ComponentHealth, DatabaseType};
    use crate::providers::MockDatabaseProvisioner;
    use crate::resources::fixtures::{component, runtime};
    use crate::store::RuntimeStore;
    use std::sync::Arc;

    fn demo() -> TribefireRuntime {
        runtime(vec![
            component("master", "services"),
            component("control-center", "control-center"),
        ])
    }

    /// Run a first pass, roll everything out and converge status
    async fn synced(store: &FakeStore, events: &EventCapture) {
        let ctx = test_context(store.clone(), events.clone());
        SpecSyncEngine::new(&ctx)
            .sync(&store.runtime().unwrap())
            .await
            .unwrap();
        store.roll_out_all();
        SpecSyncEngine::new(&ctx)
            .sync(&store.runtime().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_first_sync_creates_everything_in_order() {
        let store = FakeStore::with_runtime(demo());
        let events = EventCapture::new();
        let ctx = test_context(store.clone(), events.clone());

        SpecSyncEngine::new(&ctx).sync(&demo()).await.unwrap();

        let created: Vec<String> = store
            .created()
            .into_iter()
            .map(|(kind, name)| format!("{kind}/{name}"))
            .collect();
        assert_eq!(
            created,
            [
                "Secret/demo-systemdb",
                "Secret/demo-bt-artifactory",
                "ServiceAccount/demo",
                "Role/demo",
                "RoleBinding/demo",
                "Deployment/demo-tribefire-master",
                "Service/demo-tribefire-master",
                "Ingress/demo-tribefire-master",
                "Deployment/demo-tribefire-control-center",
                "Service/demo-tribefire-control-center",
                "Ingress/demo-tribefire-control-center",
            ]
        );

        // the shared local database already exists, so no database event
        let reasons = events.reasons();
        assert!(!reasons.contains(&"DatabaseBootstrap".to_string()));
        assert_eq!(events.notes_for("SecretBootstrap").len(), 2);
        assert_eq!(
            events.notes_for("RbacBootstrap"),
            ["Created RBAC resources"]
        );
        assert_eq!(
            events.notes_for("ComponentDeployment"),
            ["Deployed components master, control-center"]
        );

        let status = store.runtime().unwrap().status.unwrap();
        assert_eq!(status.phase, Some(DeploymentPhase::TribefireRunning));
        assert_eq!(status.message.as_deref(), Some("degraded"));
    }

    #[tokio::test]
    async fn story_resync_of_synced_runtime_changes_nothing() {
        let store = FakeStore::with_runtime(demo());
        let events = EventCapture::new();
        synced(&store, &events).await;
        let writes_before = store.status_writes().len();
        let created_before = store.created().len();
        let events_before = events.events().len();

        let ctx = test_context(store.clone(), events.clone());
        SpecSyncEngine::new(&ctx)
            .sync(&store.runtime().unwrap())
            .await
            .unwrap();

        assert_eq!(store.created().len(), created_before);
        assert!(store.deployment_updates().is_empty());
        assert!(store.ingress_updates().is_empty());
        assert_eq!(store.status_writes().len(), writes_before);
        assert_eq!(events.events().len(), events_before);

        let status = store.runtime().unwrap().status.unwrap();
        assert_eq!(status.message.as_deref(), Some("available"));
        assert!(status
            .component_status
            .iter()
            .all(|c| c.status == ComponentHealth::Available));
    }

    #[tokio::test]
    async fn story_scaling_a_component_updates_its_deployment() {
        let store = FakeStore::with_runtime(demo());
        let events = EventCapture::new();
        synced(&store, &events).await;

        let mut rt = store.runtime().unwrap();
        rt.spec.components[0].replicas = 3;
        rt.metadata.generation = Some(2);
        store.set_runtime(rt.clone());

        let ctx = test_context(store.clone(), events.clone());
        SpecSyncEngine::new(&ctx).sync(&rt).await.unwrap();

        let updates = store.deployment_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].spec.as_ref().unwrap().replicas, Some(3));
        assert!(events.reasons().contains(&"ComponentScaled".to_string()));
        assert_eq!(store.runtime().unwrap().status.unwrap().observed_generation, 2);
    }

    #[tokio::test]
    async fn story_changed_api_path_replaces_the_ingress() {
        let store = FakeStore::with_runtime(demo());
        let events = EventCapture::new();
        synced(&store, &events).await;

        let mut rt = store.runtime().unwrap();
        rt.spec.components[1].api_path = Some("/cc".to_string());
        store.set_runtime(rt.clone());

        let ctx = test_context(store.clone(), events.clone());
        SpecSyncEngine::new(&ctx).sync(&rt).await.unwrap();

        let updates = store.ingress_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name_any(), "demo-tribefire-control-center");
    }

    async fn assign_ingress_class(store: &FakeStore, name: &str, class: &str) {
        let mut ingress = store.get_ingress("tf", name).await.unwrap().unwrap();
        ingress.spec.as_mut().unwrap().ingress_class_name = Some(class.to_string());
        store.put_ingress(name, ingress);
    }

    #[tokio::test]
    async fn story_defaulted_ingress_class_is_not_drift() {
        let store = FakeStore::with_runtime(demo());
        let events = EventCapture::new();
        synced(&store, &events).await;
        assign_ingress_class(&store, "demo-tribefire-master", "nginx").await;

        let mut rt = store.runtime().unwrap();
        rt.metadata.generation = Some(2);
        store.set_runtime(rt.clone());
        let ctx = test_context(store.clone(), events.clone());
        SpecSyncEngine::new(&ctx).sync(&rt).await.unwrap();

        assert!(store.ingress_updates().is_empty());
    }

    #[tokio::test]
    async fn story_replaced_ingress_keeps_its_class() {
        let store = FakeStore::with_runtime(demo());
        let events = EventCapture::new();
        synced(&store, &events).await;
        assign_ingress_class(&store, "demo-tribefire-control-center", "nginx").await;

        let mut rt = store.runtime().unwrap();
        rt.spec.components[1].api_path = Some("/cc".to_string());
        store.set_runtime(rt.clone());
        let ctx = test_context(store.clone(), events.clone());
        SpecSyncEngine::new(&ctx).sync(&rt).await.unwrap();

        let updates = store.ingress_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].spec.as_ref().unwrap().ingress_class_name.as_deref(),
            Some("nginx")
        );
    }

    #[tokio::test]
    async fn story_invalid_component_fails_validation() {
        let rt = runtime(vec![]);
        let mut broken = rt.clone();
        broken.spec.components = vec![component("shop", "cartridge")];
        let store = FakeStore::with_runtime(broken.clone());
        let events = EventCapture::new();
        let ctx = test_context(store.clone(), events.clone());

        let err = SpecSyncEngine::new(&ctx).sync(&broken).await.unwrap_err();

        assert!(!err.is_retryable());
        assert!(store.created().is_empty());
        assert_eq!(events.reasons(), ["TribefireValidation"]);
        assert!(events.has_warning());
        let status = store.runtime().unwrap().status.unwrap();
        assert!(status.error);
        assert_eq!(status.phase, Some(DeploymentPhase::TribefireValidation));
    }

    #[tokio::test]
    async fn story_failing_step_aborts_the_rest() {
        let store = FakeStore::with_runtime(demo());
        store.fail_creates_of("Role");
        let events = EventCapture::new();
        let ctx = test_context(store.clone(), events.clone());

        assert!(SpecSyncEngine::new(&ctx).sync(&demo()).await.is_err());

        assert!(!store
            .created()
            .iter()
            .any(|(kind, _)| kind == "RoleBinding" || kind == "Deployment"));
        let warnings = events.notes_for("RbacBootstrap");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("Failed to create Role demo"));
    }

    #[tokio::test]
    async fn story_database_failure_is_reported() {
        let store = FakeStore::with_runtime(demo());
        let events = EventCapture::new();
        let mut ctx = test_context(store.clone(), events.clone());
        let mut database = MockDatabaseProvisioner::new();
        database
            .expect_create_database()
            .returning(|_| Err(Error::provider("instance not reachable")));
        ctx.database = Arc::new(database);

        let err = SpecSyncEngine::new(&ctx).sync(&demo()).await.unwrap_err();

        assert!(matches!(err, Error::Provider(_)));
        assert!(store.created().is_empty());
        assert_eq!(
            events.notes_for("DatabaseBootstrap"),
            ["Failed to create database: provider error: instance not reachable"]
        );
    }

    #[tokio::test]
    async fn managed_database_requires_the_service_account_file() {
        let mut rt = demo();
        rt.spec.database_type = DatabaseType::CloudSql;
        let store = FakeStore::with_runtime(rt.clone());
        let events = EventCapture::new();
        let mut ctx = test_context(store.clone(), events.clone());
        ctx.config.service_account_file = "/nonexistent/service-account.json".into();
        let mut database = MockDatabaseProvisioner::new();
        database.expect_create_database().returning(|_| {
            Ok((
                DatabaseCredentials {
                    user: "demo".to_string(),
                    password: "secret".to_string(),
                    database: "tf_demo".to_string(),
                    host: "127.0.0.1:5432".to_string(),
                },
                CreateOutcome::Created,
            ))
        });
        ctx.database = Arc::new(database);

        let err = SpecSyncEngine::new(&ctx).sync(&rt).await.unwrap_err();

        assert!(matches!(err, Error::LocalIo { .. }));
        assert_eq!(
            events.notes_for("DatabaseBootstrap"),
            ["Created database tf_demo"]
        );
        assert_eq!(store.created().len(), 1);
    }

    #[tokio::test]
    async fn activemq_backend_is_deployed() {
        let mut rt = demo();
        rt.spec.backend.type_ = MessagingBackend::ActiveMq;
        let store = FakeStore::with_runtime(rt.clone());
        let events = EventCapture::new();
        let ctx = test_context(store.clone(), events.clone());

        SpecSyncEngine::new(&ctx).sync(&rt).await.unwrap();

        let created = store.created();
        assert!(created.contains(&("Deployment".to_string(), "demo-activemq".to_string())));
        assert!(created.contains(&("Service".to_string(), "demo-activemq".to_string())));
        assert_eq!(
            events.notes_for("BackendBootstrap"),
            ["Created ActiveMQ backend"]
        );
    }
}
