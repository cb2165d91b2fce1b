//! Tribefire Operator - reconciles TribefireRuntime resources

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use tribefire_operator::config::{LogLevelPolicy, ReconcileConfig, DEFAULT_IMAGE_REGISTRY};
use tribefire_operator::controller::{error_policy, reconcile, Context, CONTROLLER_NAME};
use tribefire_operator::crd::TribefireRuntime;
use tribefire_operator::providers::LocalDatabaseProvisioner;
use tribefire_operator::retry::RetryPolicy;
use tribefire_operator::telemetry::{init_telemetry, TelemetryConfig};

/// Tribefire Operator - manages TribefireRuntime installations
#[derive(Parser, Debug)]
#[command(name = "tribefire-operator", version, about, long_about = None)]
struct Cli {
    /// Print the TribefireRuntime CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    Controller(ControllerArgs),
}

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Only watch runtimes in this namespace, all namespaces if unset
    #[arg(long, env = "TRIBEFIRE_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Host of the shared system database server
    #[arg(
        long,
        env = "TRIBEFIRE_LOCAL_DATABASE_HOST",
        default_value = "tribefire-postgres.tribefire.svc.cluster.local:5432"
    )]
    local_database_host: String,

    /// User of the shared system database server
    #[arg(long, env = "TRIBEFIRE_LOCAL_DATABASE_USER", default_value = "postgres")]
    local_database_user: String,

    /// Password of the shared system database server
    #[arg(
        long,
        env = "TRIBEFIRE_LOCAL_DATABASE_PASSWORD",
        default_value = "postgres",
        hide_env_values = true
    )]
    local_database_password: String,

    /// Registry prefix for default component images
    #[arg(long, env = "TRIBEFIRE_IMAGE_REGISTRY", default_value = DEFAULT_IMAGE_REGISTRY)]
    image_registry: String,

    /// dockerconfigjson written into each runtime's image pull secret
    #[arg(long, env = "TRIBEFIRE_IMAGE_PULL_SECRET_FILE")]
    image_pull_secret_file: Option<PathBuf>,

    /// Service account JSON for the cloudsql proxy
    #[arg(
        long,
        env = "TRIBEFIRE_SERVICE_ACCOUNT_FILE",
        default_value = "/etc/tribefire/cloudsql/service-account.json"
    )]
    service_account_file: PathBuf,

    /// Seconds before a failed sync is retried
    #[arg(long, env = "TRIBEFIRE_REQUEUE_SECS", default_value = "5")]
    requeue_secs: u64,

    /// Seconds between health refreshes of a synced runtime
    #[arg(long, env = "TRIBEFIRE_RESYNC_SECS", default_value = "300")]
    resync_secs: u64,

    /// Seconds a single reconcile may take
    #[arg(long, env = "TRIBEFIRE_RECONCILE_TIMEOUT_SECS", default_value = "120")]
    reconcile_timeout_secs: u64,

    /// Re-reads while waiting for a status write to become visible
    #[arg(long, env = "TRIBEFIRE_STATUS_RETRIES", default_value = "10")]
    status_retries: u32,

    /// Retries while waiting for an ingress to become readable
    #[arg(long, env = "TRIBEFIRE_ENDPOINT_RETRIES", default_value = "10")]
    endpoint_retries: u32,

    /// Run a full sync even when the generation was already observed
    #[arg(long, env = "TRIBEFIRE_SAME_GENERATION_RECONCILE")]
    same_generation_reconcile: bool,

    /// How a changed log level is handled: record-only or apply
    #[arg(long, env = "TRIBEFIRE_LOG_LEVEL_POLICY", default_value = "record-only")]
    log_level_policy: LogLevelPolicy,

    /// Delete the master deployment and external database on runtime deletion
    #[arg(long, env = "TRIBEFIRE_FOREGROUND_CLEANUP")]
    foreground_cleanup: bool,

    /// OTLP gRPC endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl ControllerArgs {
    fn reconcile_config(&self) -> ReconcileConfig {
        let delay = Duration::from_secs(1);
        ReconcileConfig {
            requeue_after: Duration::from_secs(self.requeue_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
            endpoint_retry: RetryPolicy::new(self.endpoint_retries, delay),
            status_retry: RetryPolicy::new(self.status_retries, delay),
            same_generation_reconcile: self.same_generation_reconcile,
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            service_account_file: self.service_account_file.clone(),
            image_pull_secret_file: self.image_pull_secret_file.clone(),
            image_registry: self.image_registry.clone(),
            log_level_policy: self.log_level_policy,
            foreground_cleanup: self.foreground_cleanup,
            ..ReconcileConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&TribefireRuntime::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::parse_from(["controller"]),
    };
    run_controller(args).await
}

/// Run the TribefireRuntime controller until a shutdown signal arrives
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig {
        otlp_endpoint: args.otlp_endpoint.clone(),
        ..TelemetryConfig::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!("Tribefire operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let database = Arc::new(LocalDatabaseProvisioner::new(
        args.local_database_host.clone(),
        args.local_database_user.clone(),
        args.local_database_password.clone(),
    ));
    let ctx = Arc::new(
        Context::builder(client.clone())
            .database(database)
            .config(args.reconcile_config())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create controller context: {}", e))?,
    );

    let (runtimes, deployments, ingresses) = match &args.watch_namespace {
        Some(ns) => (
            Api::<TribefireRuntime>::namespaced(client.clone(), ns),
            Api::<Deployment>::namespaced(client.clone(), ns),
            Api::<Ingress>::namespaced(client.clone(), ns),
        ),
        None => (
            Api::<TribefireRuntime>::all(client.clone()),
            Api::<Deployment>::all(client.clone()),
            Api::<Ingress>::all(client.clone()),
        ),
    };

    tracing::info!(
        namespace = args.watch_namespace.as_deref().unwrap_or("*"),
        "Starting TribefireRuntime controller"
    );

    Controller::new(runtimes, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .owns(ingresses, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Runtime reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Runtime reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Tribefire operator shutting down");
    Ok(())
}

/// Ensure the TribefireRuntime CRD is installed
///
/// Applied with server-side apply on every start so the schema always matches
/// the running operator.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    tracing::info!("Installing TribefireRuntime CRD...");
    crds.patch(
        "tribefireruntimes.tribefire.cloud",
        &params,
        &Patch::Apply(&TribefireRuntime::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install TribefireRuntime CRD: {}", e))?;

    Ok(())
}
