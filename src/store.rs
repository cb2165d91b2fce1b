//! Read/write access to runtimes and the objects they own
//!
//! The reconciler only talks to the API server through [`RuntimeStore`].
//! NotFound never surfaces as an error here: reads return `None`, deletes
//! succeed. A create that hits an existing object reports
//! [`CreateOutcome::AlreadyExists`].

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::TribefireRuntime;
use crate::Error;

/// Field manager for patches issued by the operator
pub const FIELD_MANAGER: &str = "tribefire-operator";

/// Result of a create call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The object did not exist and was created
    Created,
    /// An object with the same name already existed and was left alone
    AlreadyExists,
}

impl CreateOutcome {
    /// True if this call created the object
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created)
    }
}

/// Any object a runtime owns, as handed to [`RuntimeStore::create`]
#[derive(Clone, Debug)]
pub enum ManagedResource {
    /// Database, service account or pull secret
    Secret(Secret),
    /// Runtime service account
    ServiceAccount(ServiceAccount),
    /// Runtime role
    Role(Role),
    /// Binding of the runtime role to its service account
    RoleBinding(RoleBinding),
    /// Component or backend deployment
    Deployment(Deployment),
    /// Component or backend service
    Service(Service),
    /// Component ingress
    Ingress(Ingress),
}

impl ManagedResource {
    /// Kubernetes kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Secret(_) => "Secret",
            Self::ServiceAccount(_) => "ServiceAccount",
            Self::Role(_) => "Role",
            Self::RoleBinding(_) => "RoleBinding",
            Self::Deployment(_) => "Deployment",
            Self::Service(_) => "Service",
            Self::Ingress(_) => "Ingress",
        }
    }

    /// Object name
    pub fn name(&self) -> String {
        match self {
            Self::Secret(o) => o.name_any(),
            Self::ServiceAccount(o) => o.name_any(),
            Self::Role(o) => o.name_any(),
            Self::RoleBinding(o) => o.name_any(),
            Self::Deployment(o) => o.name_any(),
            Self::Service(o) => o.name_any(),
            Self::Ingress(o) => o.name_any(),
        }
    }
}

/// Store operations used by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    /// Fetch a runtime, `None` if it does not exist
    async fn get_runtime(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TribefireRuntime>, Error>;

    /// Persist `metadata.finalizers` of the given runtime.
    ///
    /// The runtime's resourceVersion is sent along, so a write against a
    /// stale copy fails with a conflict.
    async fn update_finalizers(&self, runtime: &TribefireRuntime) -> Result<(), Error>;

    /// Persist the status sub-resource of the given runtime
    async fn update_status(&self, runtime: &TribefireRuntime) -> Result<(), Error>;

    /// Create an owned object
    async fn create(&self, resource: &ManagedResource) -> Result<CreateOutcome, Error>;

    /// Fetch a deployment, `None` if it does not exist
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error>;

    /// Replace a deployment with the given object
    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Fetch an ingress, `None` if it does not exist
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error>;

    /// Replace an ingress with the given object
    async fn update_ingress(&self, ingress: &Ingress) -> Result<(), Error>;

    /// Delete a deployment with foreground propagation. Missing is success.
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`RuntimeStore`] backed by the Kubernetes API
pub struct KubeRuntimeStore {
    client: Client,
}

impl KubeRuntimeStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create_obj<K>(&self, obj: &K) -> Result<CreateOutcome, Error>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = namespace_of(obj)?;
        match self
            .api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await
        {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_obj<K>(&self, obj: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = namespace_of(obj)?;
        self.api::<K>(&namespace)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?;
        Ok(())
    }
}

fn namespace_of<K>(obj: &K) -> Result<String, Error>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    obj.meta().namespace.clone().ok_or_else(|| {
        Error::validation(format!(
            "{} {} has no namespace",
            K::kind(&Default::default()),
            obj.meta().name.as_deref().unwrap_or_default()
        ))
    })
}

#[async_trait]
impl RuntimeStore for KubeRuntimeStore {
    async fn get_runtime(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TribefireRuntime>, Error> {
        self.get_opt(namespace, name).await
    }

    async fn update_finalizers(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        let patch = json!({
            "metadata": {
                "finalizers": runtime.finalizers(),
                "resourceVersion": runtime.resource_version(),
            }
        });
        self.api::<TribefireRuntime>(&runtime.namespace_or_default())
            .patch(
                &runtime.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn update_status(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        let patch = json!({ "status": runtime.status });
        self.api::<TribefireRuntime>(&runtime.namespace_or_default())
            .patch_status(
                &runtime.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn create(&self, resource: &ManagedResource) -> Result<CreateOutcome, Error> {
        let outcome = match resource {
            ManagedResource::Secret(o) => self.create_obj(o).await?,
            ManagedResource::ServiceAccount(o) => self.create_obj(o).await?,
            ManagedResource::Role(o) => self.create_obj(o).await?,
            ManagedResource::RoleBinding(o) => self.create_obj(o).await?,
            ManagedResource::Deployment(o) => self.create_obj(o).await?,
            ManagedResource::Service(o) => self.create_obj(o).await?,
            ManagedResource::Ingress(o) => self.create_obj(o).await?,
        };
        debug!(
            kind = resource.kind(),
            name = %resource.name(),
            ?outcome,
            "create"
        );
        Ok(outcome)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        self.get_opt(namespace, name).await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.replace_obj(deployment).await
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error> {
        self.get_opt(namespace, name).await
    }

    async fn update_ingress(&self, ingress: &Ingress) -> Result<(), Error> {
        self.replace_obj(ingress).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api::<Deployment>(namespace)
            .delete(name, &DeleteParams::foreground())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
