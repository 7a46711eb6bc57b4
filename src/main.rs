use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::api::{Api, ListParams};
use mesh_operator::controller::{
    self, ClusterClient, ComponentOrder, ControlPlaneReconciler, DirectoryRenderer, EngineConfig,
    HookRegistry, KubeClusterClient, ReadinessConfig, SccGrants, SecurityContextGrants,
    ThreeWayMergePatchFactory,
};
use mesh_operator::crd::ServiceMeshControlPlane;
use mesh_operator::Error;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
    /// Show the control planes in the cluster
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace the operator runs in; holds the leader election lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "istio-operator")]
    namespace: String,

    /// Only watch control planes in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Root of the pre-rendered charts, one directory per control plane version
    #[arg(
        long,
        env = "MANIFESTS_DIR",
        default_value = "/usr/local/share/mesh-operator/manifests"
    )]
    manifests_dir: PathBuf,

    /// SecurityContextConstraints granted to every ServiceAccount (OpenShift)
    #[arg(long, env = "SCC_GRANTS", value_delimiter = ',')]
    scc_grants: Vec<String>,

    /// Components installed first, in this order
    #[arg(long, env = "COMPONENT_ORDER", value_delimiter = ',')]
    component_order: Vec<String>,

    /// Components whose Deployments must be ready before the next component
    #[arg(
        long,
        env = "WAIT_FOR_COMPONENTS",
        value_delimiter = ',',
        default_value = "istio/charts/galley,istio/charts/sidecarInjectorWebhook"
    )]
    wait_for: Vec<String>,

    /// Readiness checks per waited-on component
    #[arg(long, env = "READINESS_ATTEMPTS", default_value_t = 10)]
    readiness_attempts: u32,

    /// Seconds between readiness checks
    #[arg(long, env = "READINESS_INTERVAL_SECS", default_value_t = 6)]
    readiness_interval_secs: u64,

    /// Seconds between resyncs of reconciled control planes; 0 disables
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 300)]
    resync_interval_secs: u64,

    /// Port of the REST API
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    api_port: u16,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Only list control planes in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("mesh-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: Api<ServiceMeshControlPlane> = match &args.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let control_planes = api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;

    println!("Managed control planes: {}", control_planes.items.len());
    for smcp in &control_planes.items {
        let status = smcp.status_or_default();
        println!(
            "  {}/{} version={} installed={} reconciled={} components={}",
            smcp.metadata.namespace.as_deref().unwrap_or_default(),
            smcp.metadata.name.as_deref().unwrap_or_default(),
            smcp.spec.version,
            status.status.is_installed(),
            status.status.is_reconciled(),
            status.component_status.len()
        );
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

fn engine_config(args: &RunArgs) -> EngineConfig {
    let component_order = if args.component_order.is_empty() {
        ComponentOrder::default()
    } else {
        ComponentOrder::new(args.component_order.clone())
    };

    EngineConfig {
        component_order,
        readiness: ReadinessConfig {
            wait_for: args.wait_for.clone(),
            attempts: args.readiness_attempts,
            interval: Duration::from_secs(args.readiness_interval_secs),
        },
        ..Default::default()
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);

    info!("Starting mesh-operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    let grants: Option<Arc<dyn SecurityContextGrants>> = if args.scc_grants.is_empty() {
        None
    } else {
        info!("Granting SecurityContextConstraints {:?}", args.scc_grants);
        Some(Arc::new(SccGrants::new(
            cluster.clone(),
            args.scc_grants.clone(),
        )))
    };

    let engine = ControlPlaneReconciler::new(
        cluster,
        Arc::new(DirectoryRenderer::new(args.manifests_dir.clone())),
        Arc::new(ThreeWayMergePatchFactory),
        Arc::new(HookRegistry::with_builtin_hooks(grants)),
        engine_config(&args),
    );

    // Leader election configuration
    let leader_namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
    let holder_identity = controller::holder_identity();
    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));
    tokio::spawn(controller::run_leader_election(
        client.clone(),
        leader_namespace,
        holder_identity,
        Arc::clone(&is_leader),
    ));

    let state = Arc::new(controller::ControllerState {
        client,
        engine: Arc::new(engine),
        namespace: args.watch_namespace.clone(),
        resync_interval: Duration::from_secs(args.resync_interval_secs),
        is_leader: Arc::clone(&is_leader),
    });

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let port = args.api_port;
        tokio::spawn(async move {
            if let Err(e) = mesh_operator::rest_api::run_server(api_state, port).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    info!("Waiting for leadership");
    controller::wait_for_leadership(&is_leader).await;

    controller::run_controller(state).await
}
