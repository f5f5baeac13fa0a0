//! Joblet daemon entry point.
//!
//! One binary, two lives: without `EXEC_MODE` it is the supervisor daemon;
//! with `EXEC_MODE=isolated-init` it is the freshly cloned child that will
//! become PID 1 of a job's namespaces. The dispatch happens before the
//! async runtime exists so the init path stays a plain single-threaded
//! process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use joblet_api::{AppState, routes};
use joblet_config::JobletConfig;
use joblet_core::JobState;
use joblet_executor::cgroup::CgroupManager;
use joblet_executor::gpu::GpuManager;
use joblet_executor::network::NetworkAttacher;
use joblet_executor::runtime::RuntimeManager;
use joblet_executor::spawn::JobSpawner;
use joblet_executor::volume::VolumeManager;
use joblet_executor::{EXEC_MODE_ENV, EXEC_MODE_INIT};
use joblet_logs::{IpcSink, LogHub, MetricsHub};
use joblet_platform::LinuxPlatform;
use joblet_store::JobStore;
use joblet_supervisor::{Supervisor, WorkflowEngine, scheduler};

fn main() -> anyhow::Result<()> {
    if std::env::var(EXEC_MODE_ENV).as_deref() == Ok(EXEC_MODE_INIT) {
        // Never returns: execs the user command or exits 255.
        let platform = LinuxPlatform::new();
        joblet_executor::init::run(&platform);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = JobletConfig::discover()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: JobletConfig) -> anyhow::Result<()> {
    let platform: Arc<dyn joblet_platform::Platform> = Arc::new(LinuxPlatform::new());

    let sink = config.sink.socket.clone().map(|socket| {
        info!(socket = %socket.display(), "Event sink forwarding enabled");
        IpcSink::connect(socket)
    });

    let cgroups = Arc::new(CgroupManager::new(
        platform.clone(),
        config.cgroup.subtree.clone(),
    ));
    if let Err(err) = cgroups.ensure_controllers() {
        // Without delegation jobs will fail at spawn; the API should still
        // come up so the operator can see why.
        warn!(error = %err, "Cgroup controller setup failed");
    }

    let runtimes = Arc::new(RuntimeManager::new(
        platform.clone(),
        config.runtimes_root.clone(),
    ));
    let volumes = Arc::new(VolumeManager::new(platform.clone(), config.volumes_dir()));
    let network = Arc::new(NetworkAttacher::new(
        platform.clone(),
        config.network.clone(),
    )?);
    let gpus = Arc::new(GpuManager::new(
        platform.clone(),
        Duration::from_millis(config.metrics.gpu_cache_ms),
    ));
    let spawner = Arc::new(JobSpawner::new(
        platform.clone(),
        config.clone(),
        cgroups.clone(),
        runtimes.clone(),
        volumes.clone(),
        network,
        gpus.clone(),
    ));
    let store = Arc::new(JobStore::new());
    let log_hub = Arc::new(LogHub::new(
        platform.clone(),
        config.logs.clone(),
        config.logs_dir(),
        sink.clone(),
    ));
    let metrics_hub = Arc::new(MetricsHub::new(
        platform.clone(),
        config.metrics_dir(),
        sink,
    ));

    let supervisor = Supervisor::new(
        platform,
        config.clone(),
        store,
        spawner,
        cgroups,
        gpus,
        log_hub,
        metrics_hub,
    );

    let engine = WorkflowEngine::new(
        Arc::new(supervisor.clone()),
        runtimes.clone(),
        volumes.clone(),
        config.workflow.default_volume_size.clone(),
        Duration::from_secs(config.workflow.tick_secs),
        Duration::from_secs(config.workflow.watch_secs),
    );

    tokio::spawn(scheduler::run(supervisor.clone()));
    tokio::spawn(engine.clone().run_loop());

    let state = AppState::new(supervisor.clone(), engine, runtimes, volumes);
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server.listen.parse()?;
    info!(addr = %addr, "Starting joblet daemon");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_jobs(&supervisor).await;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("Shutdown requested");
}

/// Stop everything still running with the graduated sequence so log buffers
/// drain before the process exits.
async fn shutdown_jobs(supervisor: &Supervisor) {
    let running: Vec<_> = supervisor
        .store()
        .list()
        .into_iter()
        .filter(|job| {
            matches!(
                job.state,
                JobState::Running | JobState::Initializing | JobState::Pending
            )
        })
        .collect();
    if running.is_empty() {
        return;
    }
    info!(count = running.len(), "Stopping jobs for shutdown");
    let stops = running.iter().map(|job| supervisor.stop_job(&job.id));
    for result in futures::future::join_all(stops).await {
        if let Err(err) = result {
            warn!(error = %err, "Stop during shutdown failed");
        }
    }
    // Give the drain windows a moment before the process exits.
    tokio::time::sleep(supervisor.config().drain_window() * 2).await;
}
