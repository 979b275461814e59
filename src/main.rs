//! Autoscaling control plane binary: parses configuration, wires the
//! Decision Engine, Control Loop, Replica State Fetcher, and Telemetry API
//! together, and serves until told to shut down (§4, §7).

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use autoscaler_control_plane::autoscaler::api::{self, ApiState};
use autoscaler_control_plane::autoscaler::control_loop::{
    new_replica_snapshot, run_replica_state_fetcher, ControlLoop, ControlLoopConfig,
};
use autoscaler_control_plane::autoscaler::engine::Autoscaler;
use autoscaler_control_plane::autoscaler::engine_hetero::{HeteroConfig, HeteroEngine};
use autoscaler_control_plane::autoscaler::engine_rate::{RateThresholdConfig, RateThresholdEngine};
use autoscaler_control_plane::autoscaler::replica_manager::{InMemoryReplicaManager, ReplicaManager};
use autoscaler_control_plane::autoscaler::state_store::{FileStateStore, InMemoryStateStore, StateStore};
use autoscaler_control_plane::autoscaler::{Cli, ValidatedConfig};
use autoscaler_control_plane::error::ControlPlaneError;

/// Fatal configuration errors exit 2; everything else that reaches `main`
/// uncaught exits 1 (§7). A clean shutdown exits 0.
const EXIT_CONFIGURATION_ERROR: u8 = 2;
const EXIT_CRASH: u8 = 1;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_state_store(cli: &Cli) -> Result<Arc<dyn StateStore>, ControlPlaneError> {
    match &cli.state_store_path {
        Some(path) => {
            let store = FileStateStore::open(path).map_err(|e| {
                ControlPlaneError::ConfigurationError(format!(
                    "failed to open state store at {path}: {e}"
                ))
            })?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryStateStore::new())),
    }
}

fn build_engine(cli: &Cli, validated: ValidatedConfig) -> Box<dyn Autoscaler> {
    match validated {
        ValidatedConfig::RateThreshold { accelerator } => {
            Box::new(RateThresholdEngine::new(RateThresholdConfig {
                min_replicas: cli.min_replicas,
                max_replicas: cli.max_replicas,
                upper_threshold: cli.upper_threshold,
                lower_threshold: cli.lower_threshold,
                cooldown: cli.cooldown_secs,
                window_size: cli.window_secs,
                accelerator,
            }))
        }
        ValidatedConfig::Heterogeneous { catalogue } => Box::new(HeteroEngine::new(
            HeteroConfig {
                min_replicas: cli.min_replicas,
                max_replicas: cli.max_replicas,
                cooldown: cli.cooldown_secs,
                window_size: cli.window_secs,
            },
            catalogue,
        )),
    }
}

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::from(EXIT_CRASH);
        }
    };

    // A panic anywhere in the control plane is a crash, not a clean exit:
    // catch it at the top so the process still reports exit code 1 rather
    // than aborting (§7).
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| runtime.block_on(run()))) {
        Ok(code) => code,
        Err(_) => ExitCode::from(EXIT_CRASH),
    }
}

async fn run() -> ExitCode {
    let _ = dotenv::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let validated = match cli.validate_and_build() {
        Ok(validated) => validated,
        Err(err) => {
            error!(error = %err, "invalid configuration, exiting");
            return ExitCode::from(EXIT_CONFIGURATION_ERROR);
        }
    };

    let num_classes = match &validated {
        ValidatedConfig::RateThreshold { .. } => 1,
        ValidatedConfig::Heterogeneous { catalogue } => catalogue.len(),
    };

    let state_store = match build_state_store(&cli) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "invalid configuration, exiting");
            return ExitCode::from(EXIT_CONFIGURATION_ERROR);
        }
    };
    let replica_manager: Arc<dyn ReplicaManager> = Arc::new(InMemoryReplicaManager::new(1));
    let engine: Arc<Mutex<Box<dyn Autoscaler>>> =
        Arc::new(Mutex::new(build_engine(&cli, validated)));
    let snapshot = new_replica_snapshot();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_loop = ControlLoop::new(
        ControlLoopConfig {
            service_name: cli.service_name.clone(),
            frequency: Duration::from_secs(cli.frequency_secs),
            aggregator_sync_interval: Duration::from_secs(cli.aggregator_sync_secs),
        },
        engine.clone(),
        snapshot.clone(),
        state_store.clone(),
        replica_manager,
    );
    let control_loop_handle = tokio::spawn(control_loop.run(shutdown_rx.clone()));

    let fetcher_handle = tokio::spawn(run_replica_state_fetcher(
        cli.service_name.clone(),
        state_store,
        snapshot.clone(),
        Duration::from_secs(cli.replica_fetch_secs),
        shutdown_rx.clone(),
    ));

    let api_state = ApiState::new(
        engine,
        num_classes,
        snapshot,
        cli.query_interval_secs,
        shutdown_tx,
    );
    let app = api::router(api_state);

    let addr: SocketAddr = match cli.http_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, addr = %cli.http_addr, "invalid --http-addr, exiting");
            return ExitCode::from(EXIT_CONFIGURATION_ERROR);
        }
    };
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, %addr, "failed to bind telemetry API address, exiting");
            return ExitCode::from(EXIT_CONFIGURATION_ERROR);
        }
    };
    info!(%addr, "telemetry API listening");

    let shutdown_deadline = Duration::from_secs(cli.shutdown_deadline_secs);
    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(api::await_shutdown(shutdown_rx, shutdown_deadline))
    .await;

    if let Err(err) = serve_result {
        error!(error = %err, "telemetry API server error");
        return ExitCode::from(EXIT_CRASH);
    }

    control_loop_handle.abort();
    fetcher_handle.abort();
    info!("control plane shut down cleanly");
    ExitCode::SUCCESS
}
