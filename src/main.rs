//! Channel Broker controller - reconciles channel-backed event Brokers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::DynamicObject;
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, CustomResourceExt};

use channel_broker::backoff::BackoffConfig;
use channel_broker::config::{
    ControllerConfig, DEFAULT_CHANNEL_TEMPLATE_KEY, DEFAULT_CLUSTER_DOMAIN, DEFAULT_FILTER_SERVICE,
    DEFAULT_INGRESS_SERVICE, DEFAULT_SYSTEM_NAMESPACE, DEFAULT_WORKERS,
};
use channel_broker::controller::{error_policy, log_reconcile_result, reconcile, Context};
use channel_broker::crd::Broker;
use channel_broker::kube_utils::{build_api_resource, create_client};
use channel_broker::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use channel_broker::{BROKER_ROLE_LABEL, DEFAULT_BROKER_CLASS};

/// Server-side watch timeout, kept under the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Channel Broker - controller for channel-backed event Brokers
#[derive(Parser, Debug)]
#[command(name = "channel-broker", version, about, long_about = None)]
struct Cli {
    /// Print the Broker CRD as YAML and exit
    #[arg(long)]
    crd: bool,

    /// Log line format
    #[arg(long, value_enum, env = "LOG_FORMAT", default_value_t = LogFormatArg::Json)]
    log_format: LogFormatArg,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Broker controller (default mode)
    Controller,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

/// Controller settings
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Namespace of the shared filter and ingress deployments
    #[arg(long, env = "SYSTEM_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    system_namespace: String,

    /// Cluster DNS suffix
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    cluster_domain: String,

    /// Name of the shared ingress service
    #[arg(long, env = "BROKER_INGRESS_SERVICE", default_value = DEFAULT_INGRESS_SERVICE)]
    ingress_service: String,

    /// Name of the shared filter service
    #[arg(long, env = "BROKER_FILTER_SERVICE", default_value = DEFAULT_FILTER_SERVICE)]
    filter_service: String,

    /// Broker class this controller reconciles
    #[arg(long, env = "BROKER_CLASS", default_value = DEFAULT_BROKER_CLASS)]
    broker_class: String,

    /// ConfigMap key holding the channel template
    #[arg(long, env = "CHANNEL_TEMPLATE_KEY", default_value = DEFAULT_CHANNEL_TEMPLATE_KEY)]
    channel_template_key: String,

    /// Number of Brokers reconciled concurrently
    #[arg(long, env = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: u16,

    /// apiVersion of the channel kind whose status changes requeue Brokers
    #[arg(long, env = "CHANNEL_API_VERSION", default_value = "messaging.knative.dev/v1")]
    channel_api_version: String,

    /// Channel kind whose status changes requeue Brokers
    #[arg(long, env = "CHANNEL_KIND", default_value = "InMemoryChannel")]
    channel_kind: String,

    /// Longest delay between retries of a failing Broker, in seconds
    #[arg(long, env = "MAX_RETRY_DELAY_SECS", default_value_t = 300)]
    max_retry_delay_secs: u64,

    /// Path to a kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

impl ControllerArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            system_namespace: self.system_namespace.clone(),
            cluster_domain: self.cluster_domain.clone(),
            ingress_service_name: self.ingress_service.clone(),
            filter_service_name: self.filter_service.clone(),
            broker_class: self.broker_class.clone(),
            channel_template_key: self.channel_template_key.clone(),
            workers: self.workers,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Broker::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let config = args.controller_config();
    tracing::info!(
        system_namespace = %config.system_namespace,
        broker_class = %config.broker_class,
        workers = config.workers,
        "Broker controller starting..."
    );

    let client = create_client(args.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let brokers: Api<Broker> = Api::all(client.clone());
    let endpoints: Api<Endpoints> = Api::namespaced(client.clone(), &config.system_namespace);
    let channel_resource = build_api_resource(&args.channel_api_version, &args.channel_kind);
    let channels: Api<DynamicObject> = Api::all_with(client.clone(), &channel_resource);

    let watch_config = WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let backoff = BackoffConfig::with_max_delay(Duration::from_secs(args.max_retry_delay_secs));
    let ctx = Arc::new(
        Context::builder(client)
            .config(config.clone())
            .backoff(backoff)
            .build(),
    );

    let controller = Controller::new(brokers, watch_config.clone())
        .with_config(ControllerRuntimeConfig::default().concurrency(config.workers));

    // Filter and ingress are shared, so an endpoints change concerns every Broker
    let store = controller.store();
    let all_brokers = move |_: Endpoints| {
        store
            .state()
            .into_iter()
            .map(|broker| ObjectRef::from_obj(broker.as_ref()))
            .collect::<Vec<_>>()
    };

    tracing::info!(
        channel_kind = %args.channel_kind,
        "Starting Broker controller"
    );

    controller
        .owns_with(channels, channel_resource, watch_config.clone())
        .watches(endpoints, watch_config.labels(BROKER_ROLE_LABEL), all_brokers)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move { log_reconcile_result("Broker", result) })
        .await;

    tracing::info!("Broker controller shutting down");
    Ok(())
}
