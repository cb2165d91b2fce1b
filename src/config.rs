//! Reconciler configuration
//!
//! All retry counts, delays and policy switches live in one value that is
//! built once at startup and shared read-only through the controller context.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default image registry prefix for component images
pub const DEFAULT_IMAGE_REGISTRY: &str = "registry.tribefire.cloud/cloud";

/// How a changed log level is handled by drift reconciliation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevelPolicy {
    /// Emit an event and merge the value into the live env, but never trigger
    /// a deployment update (and thus a restart) on its own
    #[default]
    RecordOnly,
    /// Treat a log level change like any other drift dimension
    Apply,
}

impl std::str::FromStr for LogLevelPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "record-only" | "record" => Ok(Self::RecordOnly),
            "apply" => Ok(Self::Apply),
            _ => Err(crate::Error::validation(format!(
                "invalid log level policy: {s}, expected one of: record-only, apply"
            ))),
        }
    }
}

/// Configuration for one reconciler instance
#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    /// Delay before re-running a sync that failed
    pub requeue_after: Duration,
    /// Delay before a healthy runtime is looked at again without a watch event
    pub resync_interval: Duration,
    /// Cleanup attempts before the finalizer is removed regardless
    pub finalizer_attempts: u32,
    /// Retries while waiting for a freshly created ingress to become readable
    pub endpoint_retry: RetryPolicy,
    /// Re-reads while waiting for a status write to become visible
    pub status_retry: RetryPolicy,
    /// Run a full sync even when the generation was already observed
    pub same_generation_reconcile: bool,
    /// Deadline for a single reconcile call
    pub reconcile_timeout: Duration,
    /// Service account JSON for the cloudsql proxy
    pub service_account_file: PathBuf,
    /// dockerconfigjson used for the image pull secret, empty auths if unset
    pub image_pull_secret_file: Option<PathBuf>,
    /// Registry prefix for default component images
    pub image_registry: String,
    /// Log level drift handling
    pub log_level_policy: LogLevelPolicy,
    /// Delete the master deployment and external database before the
    /// finalizer is released
    pub foreground_cleanup: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            requeue_after: Duration::from_secs(5),
            resync_interval: Duration::from_secs(300),
            finalizer_attempts: 2,
            endpoint_retry: RetryPolicy::new(10, Duration::from_secs(1)),
            status_retry: RetryPolicy::new(10, Duration::from_secs(1)),
            same_generation_reconcile: false,
            reconcile_timeout: Duration::from_secs(120),
            service_account_file: PathBuf::from("/etc/tribefire/cloudsql/service-account.json"),
            image_pull_secret_file: None,
            image_registry: DEFAULT_IMAGE_REGISTRY.to_string(),
            log_level_policy: LogLevelPolicy::default(),
            foreground_cleanup: false,
        }
    }
}

impl ReconcileConfig {
    /// Configuration with every retry budget set to zero
    pub fn for_testing() -> Self {
        Self {
            requeue_after: Duration::from_secs(5),
            endpoint_retry: RetryPolicy::none(),
            status_retry: RetryPolicy::none(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operator_behaviour() {
        let config = ReconcileConfig::default();
        assert_eq!(config.requeue_after, Duration::from_secs(5));
        assert_eq!(config.finalizer_attempts, 2);
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert!(!config.same_generation_reconcile);
        assert_eq!(config.log_level_policy, LogLevelPolicy::RecordOnly);
        assert!(!config.foreground_cleanup);
    }

    #[test]
    fn testing_config_has_no_retries() {
        let config = ReconcileConfig::for_testing();
        assert_eq!(config.endpoint_retry, RetryPolicy::none());
        assert_eq!(config.status_retry, RetryPolicy::none());
    }

    #[test]
    fn log_level_policy_parses() {
        assert_eq!(
            "apply".parse::<LogLevelPolicy>().unwrap(),
            LogLevelPolicy::Apply
        );
        assert_eq!(
            "Record-Only".parse::<LogLevelPolicy>().unwrap(),
            LogLevelPolicy::RecordOnly
        );
        assert!("restart".parse::<LogLevelPolicy>().is_err());
    }
}
