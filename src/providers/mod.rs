//! External collaborators of the reconciler
//!
//! - [`DatabaseProvisioner`] creates and drops a runtime's system database
//! - [`BackendHealthChecker`] probes the messaging backend

mod backend;
mod database;

pub use backend::{BackendHealthChecker, MessagingHealthChecker};
pub use database::{DatabaseCredentials, DatabaseProvisioner, LocalDatabaseProvisioner};

#[cfg(test)]
pub use backend::MockBackendHealthChecker;
#[cfg(test)]
pub use database::MockDatabaseProvisioner;
