//! Shared state handed to every reconcile call

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use super::finalizer::{ForegroundCleanup, NoopCleanup, RuntimeCleanup};
use crate::config::ReconcileConfig;
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::providers::{BackendHealthChecker, DatabaseProvisioner, MessagingHealthChecker};
use crate::retry::{Sleeper, TokioSleeper};
use crate::store::{KubeRuntimeStore, RuntimeStore};
use crate::Error;

/// Name the operator reports events and field ownership under
pub const CONTROLLER_NAME: &str = "tribefire-operator";

/// Timeout for a single backend probe request
const BACKEND_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Controller context containing shared clients and configuration
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .database(Arc::new(LocalDatabaseProvisioner::new(host, user, password)))
///     .config(config)
///     .build()?;
/// ```
pub struct Context {
    /// Runtime and owned object access (trait object for testability)
    pub store: Arc<dyn RuntimeStore>,
    /// System database provisioning
    pub database: Arc<dyn DatabaseProvisioner>,
    /// Messaging backend probe
    pub backend: Arc<dyn BackendHealthChecker>,
    /// Lifecycle events
    pub events: Arc<dyn EventPublisher>,
    /// Teardown run before the finalizer is released
    pub cleanup: Arc<dyn RuntimeCleanup>,
    /// Waits between bounded retries
    pub sleeper: Arc<dyn Sleeper>,
    /// Retry budgets and policy switches
    pub config: ReconcileConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with the given collaborators
    ///
    /// Uses [`ReconcileConfig::for_testing`], a no-op cleanup and a sleeper
    /// that never waits.
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn RuntimeStore>,
        database: Arc<dyn DatabaseProvisioner>,
        backend: Arc<dyn BackendHealthChecker>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            database,
            backend,
            events,
            cleanup: Arc::new(NoopCleanup),
            sleeper: Arc::new(crate::retry::NoopSleeper),
            config: ReconcileConfig::for_testing(),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// Every collaborator defaults to its production implementation except the
/// database provisioner, which has to be supplied.
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn RuntimeStore>>,
    database: Option<Arc<dyn DatabaseProvisioner>>,
    backend: Option<Arc<dyn BackendHealthChecker>>,
    events: Option<Arc<dyn EventPublisher>>,
    cleanup: Option<Arc<dyn RuntimeCleanup>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    config: ReconcileConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            database: None,
            backend: None,
            events: None,
            cleanup: None,
            sleeper: None,
            config: ReconcileConfig::default(),
        }
    }

    /// Set the reconciler configuration
    pub fn config(mut self, config: ReconcileConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the database provisioner
    pub fn database(mut self, database: Arc<dyn DatabaseProvisioner>) -> Self {
        self.database = Some(database);
        self
    }

    /// Override the runtime store (primarily for testing)
    pub fn store(mut self, store: Arc<dyn RuntimeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the backend health checker
    pub fn backend(mut self, backend: Arc<dyn BackendHealthChecker>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the cleanup strategy picked from the configuration
    pub fn cleanup(mut self, cleanup: Arc<dyn RuntimeCleanup>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// Override the sleeper used by retry loops
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let database = self
            .database
            .ok_or_else(|| Error::configuration("no database provisioner configured"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(KubeRuntimeStore::new(self.client.clone())));
        let backend = match self.backend {
            Some(backend) => backend,
            None => Arc::new(MessagingHealthChecker::new(BACKEND_PROBE_TIMEOUT)?),
        };
        let cleanup = self.cleanup.unwrap_or_else(|| {
            if self.config.foreground_cleanup {
                Arc::new(ForegroundCleanup::new(store.clone(), database.clone()))
            } else {
                Arc::new(NoopCleanup)
            }
        });

        Ok(Context {
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME))),
            sleeper: self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)),
            store,
            database,
            backend,
            cleanup,
            config: self.config,
        })
    }
}
