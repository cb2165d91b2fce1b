//! System database provisioning

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{DatabaseType, TribefireRuntime};
use crate::store::CreateOutcome;
use crate::Error;

/// Connection data for a runtime's system database
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseCredentials {
    /// Login user
    pub user: String,
    /// Login password
    pub password: String,
    /// Database name
    pub database: String,
    /// `host:port`
    pub host: String,
}

/// Creates and deletes the system database of a runtime
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatabaseProvisioner: Send + Sync {
    /// Create the database, or report that it already exists.
    ///
    /// Credentials are returned in both cases.
    async fn create_database(
        &self,
        runtime: &TribefireRuntime,
    ) -> Result<(DatabaseCredentials, CreateOutcome), Error>;

    /// Drop the database. Missing databases are not an error.
    async fn delete_database(&self, runtime: &TribefireRuntime) -> Result<(), Error>;
}

/// Provisioner for runtimes on the shared in-cluster PostgreSQL.
///
/// The shared server and its `postgres` database exist before any runtime,
/// so creation always reports [`CreateOutcome::AlreadyExists`]. Runtimes
/// asking for a managed database are rejected.
pub struct LocalDatabaseProvisioner {
    host: String,
    user: String,
    password: String,
}

impl LocalDatabaseProvisioner {
    /// Database name of the shared server
    pub const DATABASE: &'static str = "postgres";

    /// Provisioner handing out the given server's credentials
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    fn ensure_local(runtime: &TribefireRuntime) -> Result<(), Error> {
        match runtime.spec.database_type {
            DatabaseType::Local => Ok(()),
            DatabaseType::CloudSql => Err(Error::configuration(format!(
                "runtime {} requests database type {}, but only local databases can be provisioned",
                runtime.name_any(),
                runtime.spec.database_type
            ))),
        }
    }
}

#[async_trait]
impl DatabaseProvisioner for LocalDatabaseProvisioner {
    async fn create_database(
        &self,
        runtime: &TribefireRuntime,
    ) -> Result<(DatabaseCredentials, CreateOutcome), Error> {
        Self::ensure_local(runtime)?;
        debug!(runtime = %runtime.name_any(), host = %self.host, "using shared local database");
        Ok((
            DatabaseCredentials {
                user: self.user.clone(),
                password: self.password.clone(),
                database: Self::DATABASE.to_string(),
                host: self.host.clone(),
            },
            CreateOutcome::AlreadyExists,
        ))
    }

    async fn delete_database(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        Self::ensure_local(runtime)?;
        // shared server outlives its runtimes
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::fixtures::runtime;

    fn provisioner() -> LocalDatabaseProvisioner {
        LocalDatabaseProvisioner::new("tribefire-postgres:5432", "postgres", "postgres")
    }

    #[tokio::test]
    async fn local_database_always_exists() {
        let (credentials, outcome) = provisioner()
            .create_database(&runtime(vec![]))
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::AlreadyExists);
        assert_eq!(credentials.database, "postgres");
        assert_eq!(credentials.host, "tribefire-postgres:5432");
    }

    #[tokio::test]
    async fn managed_database_is_a_configuration_error() {
        let mut rt = runtime(vec![]);
        rt.spec.database_type = DatabaseType::CloudSql;
        let err = provisioner().create_database(&rt).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn deleting_local_database_is_a_noop() {
        assert!(provisioner()
            .delete_database(&runtime(vec![]))
            .await
            .is_ok());
    }
}
