// gitmirrord: mirror server entry point.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use gitmirror_engine::{GitBackend, MirrorConfig, MirrorService, RepositoryMirror, TracingNotifier};
use gitmirror_server::{build_router, AppState, LogFormat, ServerConfig};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gitmirrord", about = "Local git mirror that forwards agent pushes upstream")]
struct Args {
    /// Engine config file (overrides GITMIRROR_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (overrides GITMIRROR_HOST / GITMIRROR_PORT).
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ServerConfig::from_env();
    if let Some(path) = args.config {
        config.config_path = Some(path);
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    init_tracing(&config);

    let mirror_config = load_mirror_config(&config)?;
    let settings = mirror_config.engine.settings();
    let specs = mirror_config
        .repository_specs(|key| std::env::var(key))
        .context("invalid repository configuration")?;

    let service = MirrorService::<GitBackend>::with_notifier(settings.clone(), TracingNotifier);
    for spec in &specs {
        let mirror = RepositoryMirror::open(spec, &settings)
            .await
            .with_context(|| format!("failed to open mirror for {}", spec.id))?;
        service.attach(mirror).with_context(|| format!("failed to attach {}", spec.id))?;
        info!(repository_id = %spec.id, local_path = %spec.local_path.display(), "mirror attached");
    }
    if specs.is_empty() {
        warn!("no repositories configured; only /healthz will answer successfully");
    }

    let worker = service.start_forward_worker();
    let app = build_router(AppState::new(service), config.max_push_bytes);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind mirror listener on {}", config.listen_addr))?;
    info!(
        listen_addr = %config.listen_addr,
        repositories = specs.len(),
        forward_policy = ?settings.forward_policy,
        "starting mirror server"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("mirror server exited unexpectedly");
    worker.shutdown().await;
    served
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_mirror_config(config: &ServerConfig) -> anyhow::Result<MirrorConfig> {
    match &config.config_path {
        Some(path) if path.exists() => MirrorConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        Some(path) => {
            warn!(path = %path.display(), "config file not found; using defaults");
            Ok(MirrorConfig::default())
        }
        None => Ok(MirrorConfig::default()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; draining requests");
}
