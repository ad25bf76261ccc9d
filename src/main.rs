use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use snapcluster::auth::StaticTokens;
use snapcluster::config::{self, CliArgs, Command, WorkerArgs};
use snapcluster::http::{self, AppState};
use snapcluster::store::MemoryStore;
use snapcluster::supervisor::ProcessLauncher;
use snapcluster::Cluster;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();
    match cli.command.clone() {
        Some(Command::Worker(args)) => worker(args).await,
        Some(Command::Serve(_)) | None => serve(&cli).await,
    }
}

/// Logs always go to stderr; a worker's stdout carries the protocol.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn serve(cli: &CliArgs) -> Result<()> {
    let settings = config::load(cli).context("loading configuration")?;
    init_logging(&settings.logging.level);

    let cpus = num_cpus::get();
    if settings.cluster.workers > cpus {
        warn!("{} workers configured on {} cpus", settings.cluster.workers, cpus);
    }

    let store = Arc::new(MemoryStore::new());
    let _sweeper = store.spawn_sweeper(settings.store.sweep_interval);

    let launcher = ProcessLauncher::current_exe(settings.worker_args())?;
    let cluster = Cluster::start(settings.cluster_options(), Arc::new(launcher), store);

    let tokens: HashMap<String, String> = settings
        .auth
        .clients
        .iter()
        .map(|client| (client.token.clone(), client.name.clone()))
        .collect();
    let auth = StaticTokens::new(tokens);
    if auth.is_empty() {
        warn!("no clients configured; every request will be rejected");
    }

    let state = AppState {
        cluster: cluster.clone(),
        auth: Arc::new(auth),
        origin: settings.http.origin.clone(),
        render_timeout: settings.http.render_timeout,
    };

    let listener = tokio::net::TcpListener::bind(settings.http.listen)
        .await
        .with_context(|| format!("binding {}", settings.http.listen))?;
    info!(
        "listening on {} for {} ({} workers x {} slots)",
        settings.http.listen, settings.http.origin, settings.cluster.workers, settings.cluster.worker_slots
    );

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cluster.stop().await;
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}

#[cfg(feature = "cdp")]
async fn worker(args: WorkerArgs) -> Result<()> {
    use snapcluster::cdp::CdpEngine;

    init_logging(&args.log_level);
    info!("worker {} starting with {} slots", args.worker_id, args.slots);

    let engine = CdpEngine::launch(args.engine_config()).await?;
    snapcluster::worker::serve(engine, args.worker_options(), tokio::io::stdin(), tokio::io::stdout()).await?;

    info!("worker {} stopped", args.worker_id);
    Ok(())
}

#[cfg(not(feature = "cdp"))]
async fn worker(args: WorkerArgs) -> Result<()> {
    init_logging(&args.log_level);
    anyhow::bail!("worker {}: built without a browser backend (enable the `cdp` feature)", args.worker_id)
}
