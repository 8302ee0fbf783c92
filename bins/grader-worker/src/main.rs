mod archive;
mod config;
mod engine;
mod evaluator;
mod executor;
mod handlers;
mod metrics;
mod notifier;
mod orchestrator;
mod reports;
mod routes;

#[cfg(test)]
mod testing;

use anyhow::Context;
use archive::ArchiveLimits;
use axum::Router;
use config::ToolchainProfile;
use engine::{ContainerRuntime, DockerRuntime, SandboxEngine};
use executor::Grader;
use grader_common::config::StoreBackend;
use grader_common::{Config, JobStore, MemoryJobStore, RedisJobStore};
use notifier::ProgressNotifier;
use orchestrator::Orchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

pub struct AppState<R: ContainerRuntime> {
    pub orchestrator: Arc<Orchestrator<R>>,
    pub notifier: ProgressNotifier,
    pub config: Config,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    warn!("Received shutdown signal, draining in-flight grading runs...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Grader worker booting...");

    let config = Config::from_env();

    let profile = ToolchainProfile::load_default().map_err(|e| {
        error!("Failed to load toolchain profile: {}", e);
        error!("Check TOOLCHAIN_CONFIG or config/toolchain.json");
        e
    })?;
    info!(
        toolchain = %profile.name,
        image = %profile.sandbox.image,
        memory_mb = profile.sandbox.memory_limit_mb,
        cpu_limit = profile.sandbox.cpu_limit,
        timeout_secs = profile.sandbox.timeout_secs,
        "Toolchain profile loaded"
    );

    metrics::init_metrics();

    let store: Arc<dyn JobStore> = match config.store_backend {
        StoreBackend::Redis => {
            let store = RedisJobStore::connect(&config.redis_url, config.job_ttl_secs)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
            info!("Connected to Redis: {}", config.redis_url);
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory job store; records are lost on restart");
            Arc::new(MemoryJobStore::new())
        }
    };

    let runtime = DockerRuntime::connect().context("Failed to create Docker client")?;
    runtime
        .ping()
        .await
        .context("Docker daemon is not reachable")?;
    info!("Connected to Docker");

    let drain_grace = Duration::from_secs(profile.sandbox.timeout_secs + profile.sandbox.pull_timeout_secs);
    let engine = SandboxEngine::new(Arc::new(runtime), profile);
    let grader = Grader::new(
        engine,
        ArchiveLimits {
            max_uncompressed_bytes: config.max_uncompressed_bytes,
        },
        config.workspace_root.clone(),
    );

    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), Arc::new(grader)));
    let notifier = ProgressNotifier::new(
        store,
        Duration::from_millis(config.stream_poll_ms),
        Duration::from_secs(config.stream_max_secs),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let max_archive_bytes = config.max_archive_bytes;
    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
        notifier,
        config,
    });

    let app = Router::new()
        .merge(routes::routes(max_archive_bytes))
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("HTTP server listening on {}", addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    orchestrator.shutdown(drain_grace).await;
    info!("Grader shutdown complete");
    Ok(())
}
